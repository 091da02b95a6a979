//! Wire message types for the telemetry, command, and status topics
//!
//! Everything crossing the broker is JSON. Weights travel as decimal strings
//! so the exact value read off the scale survives the round trip; timestamps
//! are ISO-8601 UTC with a `Z` suffix.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One measurement as published on the telemetry topic.
///
/// # Examples
/// ```
/// use scale_agent::protocol::MeasurementPayload;
/// use chrono::Utc;
/// use rust_decimal::Decimal;
/// use std::str::FromStr;
///
/// let payload = MeasurementPayload {
///     measurement_id: "scale-7-1700000000".to_string(),
///     device_id: "scale-7".to_string(),
///     weight: Decimal::from_str("12.34").unwrap(),
///     timestamp: Utc::now(),
///     unit: "kg".to_string(),
/// };
/// let json = serde_json::to_string(&payload).unwrap();
/// assert!(json.contains("\"weight\":\"12.34\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementPayload {
    /// Stable identifier for downstream de-duplication: `{device_id}-{unix_seconds}`
    pub measurement_id: String,
    /// Device this measurement came from
    pub device_id: String,
    /// Exact decimal weight, serialized as a string to preserve its scale
    pub weight: Decimal,
    /// Acquisition time, ISO-8601 UTC
    pub timestamp: DateTime<Utc>,
    /// Unit tag, always `kg`
    pub unit: String,
}

/// Inbound command from the cloud on the per-device command topic.
///
/// The wire shape is flat: `{"action": "set_sampling_rate", "rate": "FAST"}`.
/// Parameters beyond `action` are collected as-is so the router can report
/// precisely what it could not understand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMessage {
    /// Command verb, e.g. `set_sampling_rate`
    pub action: String,
    /// Remaining parameters, keyed by name
    #[serde(flatten)]
    pub parameters: serde_json::Map<String, Value>,
}

impl CommandMessage {
    /// Look up a parameter, accepting either a JSON string or a bare number.
    pub fn parameter_str(&self, key: &str) -> Option<String> {
        match self.parameters.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Outcome label carried by every status message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
    Online,
    Offline,
}

/// Message published on the status topic: command acknowledgments and
/// presence announcements share this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMessage {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: StatusKind,
    pub message: String,
    /// Present on sampling-rate acknowledgments: the now-active interval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_interval_secs: Option<u64>,
}

impl StatusMessage {
    pub fn success(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device_id, StatusKind::Success, message)
    }

    pub fn error(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device_id, StatusKind::Error, message)
    }

    /// Presence announcement published right after a successful connect.
    pub fn online(device_id: impl Into<String>) -> Self {
        Self::new(device_id, StatusKind::Online, "agent connected")
    }

    /// Presence announcement registered as the session's last will.
    pub fn offline(device_id: impl Into<String>) -> Self {
        Self::new(device_id, StatusKind::Offline, "agent connection lost")
    }

    fn new(device_id: impl Into<String>, status: StatusKind, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            status,
            message: message.into(),
            sampling_interval_secs: None,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.sampling_interval_secs = Some(secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_measurement_payload_serializes_weight_as_string() {
        let payload = MeasurementPayload {
            measurement_id: "scale-1-1700000000".to_string(),
            device_id: "scale-1".to_string(),
            weight: Decimal::from_str("3.50").unwrap(),
            timestamp: Utc::now(),
            unit: "kg".to_string(),
        };

        let json = serde_json::to_value(&payload).unwrap();
        // Scale survives: "3.50" stays "3.50", no float round-trip.
        assert_eq!(json["weight"], "3.50");
        assert_eq!(json["unit"], "kg");
    }

    #[test]
    fn test_measurement_payload_timestamp_has_zulu_suffix() {
        let payload = MeasurementPayload {
            measurement_id: "scale-1-1700000000".to_string(),
            device_id: "scale-1".to_string(),
            weight: Decimal::ZERO,
            timestamp: Utc::now(),
            unit: "kg".to_string(),
        };

        let json = serde_json::to_value(&payload).unwrap();
        let ts = json["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "expected Zulu timestamp, got {ts}");
    }

    #[test]
    fn test_command_message_parses_flat_parameters() {
        let cmd: CommandMessage =
            serde_json::from_str(r#"{"action": "set_sampling_rate", "rate": "FAST"}"#).unwrap();

        assert_eq!(cmd.action, "set_sampling_rate");
        assert_eq!(cmd.parameter_str("rate").as_deref(), Some("FAST"));
        assert_eq!(cmd.parameter_str("missing"), None);
    }

    #[test]
    fn test_command_message_accepts_numeric_parameters() {
        let cmd: CommandMessage =
            serde_json::from_str(r#"{"action": "set_sampling_rate", "rate": 300}"#).unwrap();

        assert_eq!(cmd.parameter_str("rate").as_deref(), Some("300"));
    }

    #[test]
    fn test_command_message_without_action_is_rejected() {
        let result = serde_json::from_str::<CommandMessage>(r#"{"rate": "FAST"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_status_message_success_ack_shape() {
        let status = StatusMessage::success("scale-1", "sampling interval set to FAST")
            .with_interval(60);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["device_id"], "scale-1");
        assert_eq!(json["sampling_interval_secs"], 60);
    }

    #[test]
    fn test_status_message_omits_interval_when_absent() {
        let status = StatusMessage::error("scale-1", "unknown action 'reboot'");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "error");
        assert!(json.get("sampling_interval_secs").is_none());
    }

    #[test]
    fn test_presence_messages() {
        let online = StatusMessage::online("scale-1");
        let offline = StatusMessage::offline("scale-1");

        assert_eq!(
            serde_json::to_value(&online).unwrap()["status"],
            "online"
        );
        assert_eq!(
            serde_json::to_value(&offline).unwrap()["status"],
            "offline"
        );
    }
}
