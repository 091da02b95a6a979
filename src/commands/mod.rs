//! Command routing for the per-device command topic
//!
//! Inbound payloads are JSON commands like
//! `{"action": "set_sampling_rate", "rate": "FAST"}`. Every command that
//! parses gets exactly one acknowledgment on the status topic, success or
//! error; payloads that do not parse are logged and dropped because there is
//! nothing coherent to acknowledge. Commands are idempotent, so redelivered
//! duplicates are safe to apply again.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::sanitize_error_message;
use crate::observability::metrics::METRICS;
use crate::protocol::{CommandMessage, StatusMessage};

/// Lower bound for a custom sampling interval.
pub const MIN_INTERVAL_SECS: u64 = 10;
/// Upper bound for a custom sampling interval, one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Interval behind the `FAST` preset.
pub const FAST_INTERVAL_SECS: u64 = 60;
/// Interval behind the `SLOW` preset.
pub const SLOW_INTERVAL_SECS: u64 = 1_800;

/// Errors produced while dispatching a parsed command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("missing parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid rate '{0}': expected FAST, SLOW, or a number of seconds")]
    InvalidRate(String),

    #[error(
        "rate {0}s out of range: custom intervals must be {min}..={max} seconds",
        min = MIN_INTERVAL_SECS,
        max = MAX_INTERVAL_SECS
    )]
    RateOutOfRange(u64),
}

/// A sampling rate as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingRate {
    Fast,
    Slow,
    Custom(u64),
}

impl SamplingRate {
    /// The interval this rate stands for.
    pub fn as_secs(&self) -> u64 {
        match self {
            Self::Fast => FAST_INTERVAL_SECS,
            Self::Slow => SLOW_INTERVAL_SECS,
            Self::Custom(secs) => *secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }
}

impl FromStr for SamplingRate {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("fast") {
            return Ok(Self::Fast);
        }
        if trimmed.eq_ignore_ascii_case("slow") {
            return Ok(Self::Slow);
        }

        let secs: u64 = trimmed
            .parse()
            .map_err(|_| CommandError::InvalidRate(trimmed.to_string()))?;
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
            return Err(CommandError::RateOutOfRange(secs));
        }
        Ok(Self::Custom(secs))
    }
}

impl fmt::Display for SamplingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "FAST"),
            Self::Slow => write!(f, "SLOW"),
            Self::Custom(secs) => write!(f, "{secs}s"),
        }
    }
}

/// Dispatches commands and produces their acknowledgments
///
/// The router owns the write side of the sampling-interval channel; the
/// agent loop watches the read side and reshapes its schedule when the value
/// changes. `handle` returns the acknowledgment instead of publishing it so
/// the transport keeps a single owner.
pub struct CommandRouter {
    device_id: String,
    interval_tx: watch::Sender<Duration>,
}

impl CommandRouter {
    pub fn new(device_id: impl Into<String>, interval_tx: watch::Sender<Duration>) -> Self {
        Self {
            device_id: device_id.into(),
            interval_tx,
        }
    }

    /// The interval currently in effect.
    pub fn current_interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// Process one raw payload from the command topic.
    ///
    /// Returns the acknowledgment to publish, or `None` when the payload was
    /// not valid JSON for a command and was dropped.
    pub fn handle(&self, raw: &[u8]) -> Option<StatusMessage> {
        let command: CommandMessage = match serde_json::from_slice(raw) {
            Ok(command) => command,
            Err(e) => {
                METRICS.command_rejected();
                warn!(error = %e, "dropping malformed command payload");
                return None;
            }
        };

        METRICS.command_received();
        info!(action = %command.action, "command received");

        let ack = match self.dispatch(&command) {
            Ok(ack) => {
                METRICS.command_processed();
                ack
            }
            Err(e) => {
                METRICS.command_failed();
                let reason = sanitize_error_message(&e.to_string());
                warn!(action = %command.action, error = %reason, "command failed");
                StatusMessage::error(&self.device_id, reason)
            }
        };
        Some(ack)
    }

    fn dispatch(&self, command: &CommandMessage) -> Result<StatusMessage, CommandError> {
        match command.action.as_str() {
            "set_sampling_rate" => self.set_sampling_rate(command),
            other => Err(CommandError::UnknownAction(other.to_string())),
        }
    }

    fn set_sampling_rate(&self, command: &CommandMessage) -> Result<StatusMessage, CommandError> {
        let raw = command
            .parameter_str("rate")
            .ok_or(CommandError::MissingParameter("rate"))?;
        let rate: SamplingRate = raw.parse()?;
        let interval = rate.interval();

        // Only notify the agent loop on a real change so re-applying the
        // current rate does not restart the sleep in progress.
        let changed = self.interval_tx.send_if_modified(|current| {
            if *current == interval {
                false
            } else {
                *current = interval;
                true
            }
        });

        if changed {
            info!(rate = %rate, interval_secs = rate.as_secs(), "sampling interval updated");
        } else {
            debug!(rate = %rate, "sampling interval already in effect");
        }

        Ok(
            StatusMessage::success(&self.device_id, format!("sampling rate set to {rate}"))
                .with_interval(rate.as_secs()),
        )
    }
}
