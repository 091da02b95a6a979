//! Scale telemetry agent
//!
//! An on-device agent that reads weight frames from an industrial scale,
//! persists every measurement locally, and uploads them to an MQTT broker
//! with at-least-once delivery.
//!
//! # Overview
//!
//! The crate is organized around a small pipeline:
//! - Frame decoding for the serial and radio scale protocols
//! - A file-backed measurement store that survives restarts and outages
//! - An MQTT link with TLS, durable sessions, and forever-retrying reconnect
//! - A command router for remote sampling-rate changes
//! - The agent loop that ties acquisition, persistence, and upload together
//!
//! # Quick Start
//!
//! ```rust
//! use scale_agent::protocol::FrameDecoder;
//!
//! // Scales frame weights as `<prefix><digits>[.<digits>]kg`.
//! let decoder = FrameDecoder::serial();
//! let reading = decoder.decode(b"wn0072.85kg\r\n").unwrap();
//!
//! assert_eq!(reading.value.to_string(), "72.85");
//! assert_eq!(reading.unit, "kg");
//! ```

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod sensor;
pub mod store;
pub mod testing;
pub mod transport;

pub use agent::Agent;
pub use commands::{CommandRouter, SamplingRate};
pub use config::{ConnectionType, DeviceConfig};
pub use error::{AgentError, AgentResult};
pub use protocol::*;
pub use store::{Measurement, MeasurementStore};
pub use transport::mqtt::MqttLink;
