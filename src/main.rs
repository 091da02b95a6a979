//! Scale agent entry point
//!
//! Loads the device configuration, opens the configured sensor, brings up
//! the MQTT link, and runs the measurement loop until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use scale_agent::agent::Agent;
use scale_agent::config::{ConnectionType, DeviceConfig};
use scale_agent::observability::{init_default_logging, metrics::metrics};
use scale_agent::sensor::{BleSensor, Sensor, SerialSensor};
use scale_agent::transport::mqtt::MqttLink;
use std::path::PathBuf;
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Telemetry agent for industrial scales
#[derive(Parser)]
#[command(name = "scale-agent")]
#[command(about = "Reads scale measurements and uploads them over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "SCALE_AGENT_CONFIG",
        default_value = "/etc/scale-agent/config.json"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the measurement loop
    Run {
        /// Execute a single measurement cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Validate the configuration file
    Config {
        /// Print the loaded configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting scale agent"
    );

    let config = match DeviceConfig::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { once } => run_agent(config, once).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        process::exit(1);
    }

    info!("scale agent shutdown complete");
}

async fn run_agent(config: DeviceConfig, once: bool) -> Result<(), Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_agent_state("initializing");

    // Missing certificates are fatal: the link could never come up.
    config.verify_certificates()?;

    let sensor = build_sensor(&config).await?;
    let transport = MqttLink::new(&config)?;
    let mut agent = Agent::new(config, transport, sensor);

    agent.start().await;

    if once {
        agent.run_once().await;
        agent.shutdown().await;
        return Ok(());
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let trigger = agent.shutdown_trigger();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        let _ = trigger.send(true);
    });

    agent.run().await;
    agent.shutdown().await;

    if let Ok(snapshot) = serde_json::to_string(&collector.get_metrics()) {
        info!(metrics = %snapshot, "final metrics");
    }

    Ok(())
}

/// Open whichever sensor the configuration selects.
async fn build_sensor(config: &DeviceConfig) -> Result<Box<dyn Sensor>, Box<dyn std::error::Error>> {
    match config.connection_type {
        ConnectionType::Serial => {
            let port = config
                .serial_port
                .as_deref()
                .ok_or("serial_port missing from configuration")?;
            let baud_rate = config
                .baud_rate
                .ok_or("baud_rate missing from configuration")?;
            info!(port, baud_rate, "opening serial scale");
            Ok(Box::new(SerialSensor::open(port, baud_rate)?))
        }
        ConnectionType::Radio => {
            let address = config
                .radio_address
                .as_deref()
                .ok_or("radio_address missing from configuration")?;
            info!(address, "connecting to radio scale");
            Ok(Box::new(BleSensor::connect(address).await?))
        }
    }
}

fn handle_config_command(
    config: DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    match config.verify_certificates() {
        Ok(paths) => info!(ca = %paths.ca.display(), "certificates present"),
        Err(e) => warn!(error = %e, "certificate check failed"),
    }

    info!(device_id = %config.device_id, "configuration is valid");
    Ok(())
}
