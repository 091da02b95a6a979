//! Remote sampling-rate control for a running scale agent
//!
//! Publishes a `set_sampling_rate` command on the device's command topic
//! and waits for the agent's acknowledgment on the status topic. Connects
//! with the same certificates as the agent but under its own client
//! identifier, so the agent's durable session is left untouched.
//!
//! ## Usage
//!
//! ```bash
//! # Switch to fast sampling (every 60 seconds)
//! send-command --config /etc/scale-agent/config.json --fast
//!
//! # Switch back to slow sampling (every 30 minutes)
//! send-command --config /etc/scale-agent/config.json --slow
//!
//! # Custom interval in seconds
//! send-command --config /etc/scale-agent/config.json --seconds 300
//! ```

use clap::{ArgGroup, Parser};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, Transport};
use scale_agent::commands::SamplingRate;
use scale_agent::config::DeviceConfig;
use scale_agent::protocol::{StatusKind, StatusMessage, TopicScheme};
use scale_agent::transport::mqtt::{load_tls_configuration, parse_broker_endpoint, KEEP_ALIVE};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{timeout_at, Instant};

#[derive(Parser)]
#[command(name = "send-command")]
#[command(about = "Change the sampling rate of a running scale agent")]
#[command(group(ArgGroup::new("rate").required(true)))]
struct Args {
    /// Device configuration file (for broker, certificates, and topics)
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "SCALE_AGENT_CONFIG",
        default_value = "/etc/scale-agent/config.json"
    )]
    config: PathBuf,

    /// Sample every 60 seconds
    #[arg(long, group = "rate")]
    fast: bool,

    /// Sample every 30 minutes
    #[arg(long, group = "rate")]
    slow: bool,

    /// Custom interval in seconds (10 to 86400)
    #[arg(long, value_name = "SECS", group = "rate")]
    seconds: Option<u64>,

    /// How long to wait for the agent's acknowledgment
    #[arg(long, default_value = "10", value_name = "SECS")]
    wait: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let rate_token = match (args.fast, args.slow, args.seconds) {
        (true, _, _) => "fast".to_string(),
        (_, true, _) => "slow".to_string(),
        (_, _, Some(secs)) => secs.to_string(),
        _ => {
            eprintln!("✗ one of --fast, --slow, --seconds is required");
            process::exit(2);
        }
    };
    // Reject out-of-range intervals here instead of round-tripping them.
    let rate: SamplingRate = rate_token.parse()?;

    let config = DeviceConfig::load_from_file(&args.config)?;
    let topics = TopicScheme::new(&config.stage, &config.device_id);

    let (host, port) = parse_broker_endpoint(&config.broker_endpoint, config.broker_port)?;
    let client_id = format!(
        "scale-tool-{}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    );

    println!("Connecting to {host}:{port} as {client_id}...");
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    options.set_transport(Transport::Tls(load_tls_configuration(&config)?));

    let (client, mut event_loop) = AsyncClient::new(options, 10);

    // Subscribe before publishing so the acknowledgment cannot slip past.
    client
        .subscribe(topics.status(), QoS::AtLeastOnce)
        .await?;

    let command = json!({
        "action": "set_sampling_rate",
        "rate": rate_token,
    });
    client
        .publish(
            topics.commands(),
            QoS::AtLeastOnce,
            false,
            serde_json::to_vec(&command)?,
        )
        .await?;

    println!(
        "📤 set_sampling_rate rate={rate_token} ({}s) → {}",
        rate.as_secs(),
        topics.commands()
    );

    let status_topic = topics.status();
    let deadline = Instant::now() + Duration::from_secs(args.wait);
    loop {
        let event = match timeout_at(deadline, event_loop.poll()).await {
            Err(_) => {
                println!(
                    "✗ no acknowledgment within {}s (agent offline? the command stays queued for its durable session)",
                    args.wait
                );
                process::exit(1);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(event)) => event,
        };

        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                println!("Connected, waiting for acknowledgment...");
            }
            Event::Incoming(Incoming::Publish(publish)) if publish.topic == status_topic => {
                let status: StatusMessage = match serde_json::from_slice(&publish.payload) {
                    Ok(status) => status,
                    Err(_) => continue,
                };
                if status.device_id != config.device_id {
                    continue;
                }
                match status.status {
                    StatusKind::Success => {
                        match status.sampling_interval_secs {
                            Some(secs) => println!("✓ {} (interval {secs}s)", status.message),
                            None => println!("✓ {}", status.message),
                        }
                        break;
                    }
                    StatusKind::Error => {
                        println!("✗ agent rejected the command: {}", status.message);
                        process::exit(1);
                    }
                    // Online and offline announcements are not acks.
                    StatusKind::Online | StatusKind::Offline => continue,
                }
            }
            _ => {}
        }
    }

    client.disconnect().await?;
    Ok(())
}
