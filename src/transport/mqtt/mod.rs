//! MQTT link with durable sessions and forever-retrying reconnection
//!
//! The implementation separates pure decision logic from I/O so the
//! interesting parts stay unit-testable without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, backoff policy, and client options
//! - [`message_handler`] - Event routing and acknowledgment pairing
//! - [`client`] - The rumqttc client and its reconnect supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use scale_agent::config::DeviceConfig;
//! use scale_agent::transport::mqtt::MqttLink;
//!
//! # tokio_test::block_on(async {
//! let config = DeviceConfig::load_from_file(std::path::Path::new(
//!     "/etc/scale-agent/config.json",
//! ))?;
//!
//! let mut link = MqttLink::new(&config)?;
//! link.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttLink;
pub use connection::{
    configure_mqtt_options, load_tls_configuration, parse_broker_endpoint, ConnectionState,
    MqttError, ReconnectConfig, KEEP_ALIVE,
};
pub use message_handler::{AckRegistry, CommandForwarder, EventRoute, MessageHandler};
