//! Pure connection plumbing for the MQTT link
//!
//! This module contains the connection state vocabulary, the reconnect
//! backoff schedule, and option assembly from the device configuration.
//! Nothing here performs I/O beyond reading the certificate files.

use crate::config::DeviceConfig;
use crate::protocol::{StatusMessage, TopicScheme};
use rumqttc::{LastWill, MqttOptions, QoS, TlsConfiguration, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Broker keep-alive interval. The broker declares the session dead at
/// 1.5x this, which bounds how long a silent link can linger undetected.
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Connection state for the telemetry link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet, or stopped after an explicit shutdown (with reason)
    Disconnected(String),
    /// Dialing the broker, waiting for its ConnAck
    Connecting,
    /// Session established; publishes and the command subscription are live
    Connected,
    /// Waiting out a backoff delay before the next dial (attempt count)
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Factor stops doubling here; base * 64 already exceeds every sane cap.
const FACTOR_CAP: u64 = 64;

/// Reconnect backoff schedule
///
/// Delays follow `min(base * factor + jitter, max_delay)`. The factor
/// doubles after each failed attempt and resets to one immediately after
/// a successful connect, so a single blip recovers in seconds while a
/// real outage settles at `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First-retry delay (default 2s)
    pub base: Duration,
    /// Delay ceiling (default 60s)
    pub max_delay: Duration,
    /// How long `connect()` waits for the first ConnAck (default 10s)
    pub connect_timeout: Duration,
    /// How long a publish waits for its broker acknowledgment (default 10s)
    pub ack_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the next dial for the given backoff factor.
    ///
    /// Jitter is passed in by the caller so the schedule stays a pure
    /// function of its inputs.
    pub fn backoff_delay(&self, factor: u64, jitter: Duration) -> Duration {
        let factor = factor.clamp(1, FACTOR_CAP) as u32;
        self.base
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.max_delay)
    }

    /// Factor after one more failed attempt.
    pub fn next_factor(factor: u64) -> u64 {
        factor.max(1).saturating_mul(2).min(FACTOR_CAP)
    }
}

/// MQTT link errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("cannot read certificate file {}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("link supervisor already running")]
    AlreadyStarted,
    #[error("publish failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("broker did not acknowledge publish within {0:?}")]
    AckTimeout(Duration),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
    #[error("not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Split a broker endpoint into host and port.
///
/// Accepts either a bare hostname (paired with `default_port`) or a full
/// `mqtts://host:port` URL. Plaintext schemes are rejected; the link always
/// authenticates with mutual TLS.
pub fn parse_broker_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), MqttError> {
    let url = if endpoint.contains("://") {
        Url::parse(endpoint).map_err(|_| MqttError::InvalidEndpoint(endpoint.to_string()))?
    } else {
        Url::parse(&format!("mqtts://{endpoint}:{default_port}"))
            .map_err(|_| MqttError::InvalidEndpoint(endpoint.to_string()))?
    };

    if url.scheme() != "mqtts" {
        return Err(MqttError::InvalidEndpoint(format!(
            "{endpoint} (only mqtts is supported)"
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidEndpoint(endpoint.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(default_port);
    Ok((host, port))
}

/// Assemble MQTT options from the device configuration.
///
/// The client identifier is derived from `device_id` and the session is
/// non-clean, so the broker keeps the command subscription and queues QoS 1
/// traffic across short disconnects. The last will parks an `offline` status
/// on the status topic for ungraceful drops.
pub fn configure_mqtt_options(config: &DeviceConfig) -> Result<MqttOptions, MqttError> {
    let (host, port) = parse_broker_endpoint(&config.broker_endpoint, config.broker_port)?;

    let mut options = MqttOptions::new(config.client_id(), host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(false);
    options.set_transport(RumqttcTransport::Tls(load_tls_configuration(config)?));

    let topics = TopicScheme::new(&config.stage, &config.device_id);
    let offline = serde_json::to_vec(&StatusMessage::offline(&config.device_id))?;
    options.set_last_will(LastWill::new(topics.status(), offline, QoS::AtLeastOnce, false));

    Ok(options)
}

/// Load the mutual-TLS material referenced by the configuration.
///
/// Public so operator tools can dial the same broker under their own
/// client identifier without borrowing the agent's session options.
pub fn load_tls_configuration(config: &DeviceConfig) -> Result<TlsConfiguration, MqttError> {
    let paths = config.certificate_paths();
    let ca = read_pem(&paths.ca)?;
    let client_cert = read_pem(&paths.cert)?;
    let client_key = read_pem(&paths.key)?;

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: Some((client_cert, client_key)),
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::Certificate {
        path: path.to_path_buf(),
        source,
    })
}
