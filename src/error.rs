//! Error taxonomy for the scale agent
//!
//! Startup errors (config, certificates) are fatal and exit the process;
//! everything else is transient and absorbed at the cycle or attempt level.
//! Error text that leaves the process, in logs or on the status topic, goes
//! through [`sanitize_error_message`] first.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::commands::CommandError;
use crate::config::ConfigError;
use crate::protocol::frame::DecodeError;
use crate::sensor::SensorError;
use crate::store::StoreError;

/// Unified error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Frame decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Measurement store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("no valid reading after {attempts} attempts")]
    NoReading { attempts: usize },
}

impl AgentError {
    /// Wrap a transport-layer error from a generic transport implementation.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }

    /// Render this error with sensitive substrings redacted, for logs and
    /// status acknowledgments.
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

static SECRET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").unwrap());

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|certs?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .unwrap()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credential-shaped substrings and sensitive paths from an error
/// message and bound its length.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}
