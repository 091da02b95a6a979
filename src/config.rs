//! Device configuration loaded once at startup
//!
//! The fleet provisions each device with a single JSON file. Required fields
//! depend on how the scale is attached: serial devices need a port and baud
//! rate, radio devices need the peripheral address. A config that fails
//! validation is fatal; nothing runs on a half-configured device.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::commands::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};
use crate::protocol::topics::validate_device_id;

/// Certificate file names inside `certs_dir`, fixed by the provisioning
/// pipeline.
pub const CA_FILE: &str = "root-CA.crt";
pub const CERT_FILE: &str = "device.cert.pem";
pub const KEY_FILE: &str = "device.private.key";

/// How the scale is physically attached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Serial,
    Radio,
}

/// Main device configuration structure.
///
/// Unknown extra keys in the file are ignored so older agents tolerate newer
/// provisioning output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub device_id: String,
    /// Sensor attachment: `serial` or `radio`
    pub connection_type: ConnectionType,
    /// Serial device path, required when `connection_type = serial`
    pub serial_port: Option<String>,
    /// Serial baud rate, required when `connection_type = serial`
    pub baud_rate: Option<u32>,
    /// Peripheral MAC address, required when `connection_type = radio`
    pub radio_address: Option<String>,
    /// Broker hostname, or a `mqtts://host:port` URL
    pub broker_endpoint: String,
    /// Broker port when `broker_endpoint` is a bare hostname (default: 8883)
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Deployment stage, part of the telemetry topic
    pub stage: String,
    /// Directory holding the mTLS material (default: /etc/scale-agent/certs)
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
    /// Directory for the durable measurement records
    /// (default: /var/lib/scale-agent/measurements)
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Initial sampling interval in seconds (default: 1800)
    #[serde(default = "default_sampling_interval_secs")]
    pub sampling_interval_secs: u64,
}

fn default_broker_port() -> u16 {
    8883
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("/etc/scale-agent/certs")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/scale-agent/measurements")
}

fn default_sampling_interval_secs() -> u64 {
    1800
}

/// Absolute paths to the three mTLS files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Missing required field for {connection_type} connection: {field}")]
    MissingField {
        connection_type: &'static str,
        field: &'static str,
    },
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Missing certificate file: {}", .0.display())]
    MissingCertificate(PathBuf),
}

impl DeviceConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field presence and value ranges. Called by
    /// [`DeviceConfig::load_from_file`]; public so tests and tools can check
    /// hand-built configs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device_id)
            .map_err(|e| ConfigError::InvalidDeviceId(e.to_string()))?;

        if self.stage.is_empty() {
            return Err(ConfigError::InvalidConfig("stage cannot be empty".into()));
        }
        if self.broker_endpoint.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker_endpoint cannot be empty".into(),
            ));
        }

        match self.connection_type {
            ConnectionType::Serial => {
                if self.serial_port.is_none() {
                    return Err(ConfigError::MissingField {
                        connection_type: "serial",
                        field: "serial_port",
                    });
                }
                if self.baud_rate.is_none() {
                    return Err(ConfigError::MissingField {
                        connection_type: "serial",
                        field: "baud_rate",
                    });
                }
            }
            ConnectionType::Radio => {
                if self.radio_address.is_none() {
                    return Err(ConfigError::MissingField {
                        connection_type: "radio",
                        field: "radio_address",
                    });
                }
            }
        }

        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.sampling_interval_secs) {
            return Err(ConfigError::InvalidConfig(format!(
                "sampling_interval_secs must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS}, got {}",
                self.sampling_interval_secs
            )));
        }

        Ok(())
    }

    /// Broker client identifier, stable across restarts so the durable
    /// session is resumed rather than replaced.
    pub fn client_id(&self) -> String {
        format!("scale-{}", self.device_id)
    }

    /// Initial sampling interval.
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }

    /// Paths of the mTLS material inside `certs_dir`.
    pub fn certificate_paths(&self) -> CertificatePaths {
        CertificatePaths {
            ca: self.certs_dir.join(CA_FILE),
            cert: self.certs_dir.join(CERT_FILE),
            key: self.certs_dir.join(KEY_FILE),
        }
    }

    /// Check that all three mTLS files exist. Missing material is fatal at
    /// startup, before any connection attempt.
    pub fn verify_certificates(&self) -> Result<CertificatePaths, ConfigError> {
        let paths = self.certificate_paths();
        for path in [&paths.ca, &paths.cert, &paths.key] {
            if !path.exists() {
                return Err(ConfigError::MissingCertificate(path.clone()));
            }
        }
        Ok(paths)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let json_content = r#"
        {
            "device_id": "test-scale",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "example-ats.iot.us-east-1.amazonaws.com",
            "stage": "dev",
            "sampling_interval_secs": 60
        }"#;
        serde_json::from_str(json_content).expect("Test config should parse")
    }
}
