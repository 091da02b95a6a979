//! One-shot scale reading for wiring checks
//!
//! Opens the configured sensor, waits for a decodable frame, and prints
//! the reading. No broker connection and nothing is persisted, so this is
//! safe to run while diagnosing a flaky serial line or checking that the
//! radio scale is in range.
//!
//! ## Usage
//!
//! ```bash
//! read-sample --config /etc/scale-agent/config.json
//!
//! # Keep trying longer and show the raw frames as they arrive
//! read-sample --config /etc/scale-agent/config.json --attempts 20 --raw
//! ```

use clap::Parser;
use scale_agent::config::{ConnectionType, DeviceConfig};
use scale_agent::protocol::FrameDecoder;
use scale_agent::sensor::{BleSensor, Sensor, SerialSensor};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

/// Pause between read attempts, matching the agent's acquisition pacing.
const ATTEMPT_PAUSE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "read-sample")]
#[command(about = "Read one weight sample from the configured scale")]
struct Args {
    /// Device configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "SCALE_AGENT_CONFIG",
        default_value = "/etc/scale-agent/config.json"
    )]
    config: PathBuf,

    /// How many read attempts before giving up
    #[arg(long, default_value = "5")]
    attempts: usize,

    /// Print every raw frame, including ones that fail to decode
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = DeviceConfig::load_from_file(&args.config)?;

    let (mut sensor, decoder): (Box<dyn Sensor>, FrameDecoder) = match config.connection_type {
        ConnectionType::Serial => {
            let port = config
                .serial_port
                .as_deref()
                .ok_or("serial_port missing from configuration")?;
            let baud_rate = config
                .baud_rate
                .ok_or("baud_rate missing from configuration")?;
            println!("Opening {port} at {baud_rate} baud...");
            (
                Box::new(SerialSensor::open(port, baud_rate)?),
                FrameDecoder::serial(),
            )
        }
        ConnectionType::Radio => {
            let address = config
                .radio_address
                .as_deref()
                .ok_or("radio_address missing from configuration")?;
            println!("Connecting to radio scale {address}...");
            (
                Box::new(BleSensor::connect(address).await?),
                FrameDecoder::radio(),
            )
        }
    };

    for attempt in 1..=args.attempts {
        match sensor.read_frame().await {
            Ok(frame) => {
                if args.raw {
                    println!("  frame: {:?}", String::from_utf8_lossy(&frame));
                }
                match decoder.decode(&frame) {
                    Ok(reading) => {
                        println!("✓ {} {}", reading.value, reading.unit);
                        sensor.close().await?;
                        return Ok(());
                    }
                    Err(e) => println!("  attempt {attempt}/{}: {e}", args.attempts),
                }
            }
            Err(e) => println!("  attempt {attempt}/{}: {e}", args.attempts),
        }
        if attempt < args.attempts {
            tokio::time::sleep(ATTEMPT_PAUSE).await;
        }
    }

    println!(
        "✗ no decodable frame after {} attempts (is a load on the platter?)",
        args.attempts
    );
    sensor.close().await?;
    process::exit(1);
}
