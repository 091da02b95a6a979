//! Topic layout and device ID validation
//!
//! All broker traffic uses three topics derived from the deployment stage and
//! the device identifier: a stage-scoped measurements topic, a per-device
//! command topic, and a shared status topic.

use thiserror::Error;

/// Shared status topic every device reports on.
pub const STATUS_TOPIC: &str = "scale-status";

/// Root of the per-device command topics.
pub const COMMANDS_TOPIC_ROOT: &str = "scale-commands";

/// Builds the topic names for one device in one deployment stage.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    stage: String,
    device_id: String,
}

impl TopicScheme {
    pub fn new(stage: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            device_id: device_id.into(),
        }
    }

    /// Telemetry topic the ingest rule listens on: `{stage}/{stage}/scale-measurements`.
    pub fn measurements(&self) -> String {
        format!("{stage}/{stage}/scale-measurements", stage = self.stage)
    }

    /// Per-device command topic: `scale-commands/{device_id}`.
    pub fn commands(&self) -> String {
        format!("{COMMANDS_TOPIC_ROOT}/{}", self.device_id)
    }

    /// Shared status topic.
    pub fn status(&self) -> String {
        STATUS_TOPIC.to_string()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// Validate a device ID for use in topic names and client identifiers.
///
/// The ID ends up in MQTT topic segments and in the broker client ID, so the
/// character set is restricted to names that are safe in both.
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for identifiers that feed into topic names
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("device ID cannot be empty")]
    EmptyDeviceId,
    #[error("device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}
