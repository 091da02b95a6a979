//! Observability for the scale agent
//!
//! Structured logging and metrics collection. Log format and level come from
//! the environment; metrics accumulate in a process-wide collector and are
//! logged as one JSON snapshot at shutdown.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, cycle_span, mqtt_span, sensor_span};
