//! Thread-safe metrics collection
//!
//! Atomic counters for the measurement pipeline, the MQTT link, and command
//! handling. A snapshot of everything is logged at shutdown and available to
//! tests through [`MetricsCollector::get_metrics`].

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get a reference to the global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Measurement pipeline
    readings_acquired: AtomicU64,
    readings_failed: AtomicU64,
    measurements_persisted: AtomicU64,
    measurements_uploaded: AtomicU64,
    measurements_flushed: AtomicU64,
    cycle_times: Mutex<Vec<u64>>, // milliseconds

    // MQTT link
    connected: AtomicBool,
    connections_established: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // Command handling
    commands_received: AtomicU64,
    commands_processed: AtomicU64,
    commands_failed: AtomicU64,
    commands_rejected: AtomicU64,

    // Lifecycle
    agent_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            readings_acquired: AtomicU64::new(0),
            readings_failed: AtomicU64::new(0),
            measurements_persisted: AtomicU64::new(0),
            measurements_uploaded: AtomicU64::new(0),
            measurements_flushed: AtomicU64::new(0),
            cycle_times: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_processed: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            agent_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Measurement pipeline

    pub fn reading_acquired(&self) {
        self.readings_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_failed(&self) {
        self.readings_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn measurement_persisted(&self) {
        self.measurements_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn measurement_uploaded(&self) {
        self.measurements_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn measurements_flushed(&self, count: u64) {
        self.measurements_flushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn cycle_completed(&self, duration: Duration) {
        if let Ok(mut times) = self.cycle_times.lock() {
            times.push(duration.as_millis() as u64);

            // Keep the last 1000 cycles to bound memory on long uptimes.
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    // MQTT link

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Command handling

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle

    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current_state) = self.agent_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    /// Reset all metrics, useful for testing.
    pub fn reset(&self) {
        let now = current_timestamp();

        self.readings_acquired.store(0, Ordering::Relaxed);
        self.readings_failed.store(0, Ordering::Relaxed);
        self.measurements_persisted.store(0, Ordering::Relaxed);
        self.measurements_uploaded.store(0, Ordering::Relaxed);
        self.measurements_flushed.store(0, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connections_established.store(0, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.messages_published.store(0, Ordering::Relaxed);
        self.publish_failures.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
        self.commands_received.store(0, Ordering::Relaxed);
        self.commands_processed.store(0, Ordering::Relaxed);
        self.commands_failed.store(0, Ordering::Relaxed);
        self.commands_rejected.store(0, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.state_transitions.store(0, Ordering::Relaxed);

        if let Ok(mut times) = self.cycle_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.agent_state.lock() {
            *state = "initializing".to_string();
        }
    }

    fn cycle_statistics(&self) -> (f64, u64, u64) {
        if let Ok(times) = self.cycle_times.lock() {
            if times.is_empty() {
                (0.0, 0, 0)
            } else {
                let sum: u64 = times.iter().sum();
                let max = times.iter().copied().max().unwrap_or(0);
                (sum as f64 / times.len() as f64, max, times.len() as u64)
            }
        } else {
            (0.0, 0, 0)
        }
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if self.connected.load(Ordering::Relaxed) {
            let start = self.connection_start_time.load(Ordering::Relaxed);
            if start > 0 {
                now.saturating_sub(start)
            } else {
                0
            }
        } else {
            0
        }
    }

    fn current_agent_state(&self) -> String {
        self.agent_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get a complete metrics snapshot.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_cycle_time_ms, max_cycle_time_ms, cycles_completed) = self.cycle_statistics();

        MetricsSnapshot {
            pipeline: PipelineMetrics {
                readings_acquired: self.readings_acquired.load(Ordering::Relaxed),
                readings_failed: self.readings_failed.load(Ordering::Relaxed),
                measurements_persisted: self.measurements_persisted.load(Ordering::Relaxed),
                measurements_uploaded: self.measurements_uploaded.load(Ordering::Relaxed),
                measurements_flushed: self.measurements_flushed.load(Ordering::Relaxed),
                cycles_completed,
                avg_cycle_time_ms,
                max_cycle_time_ms,
            },
            mqtt: MqttMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            commands: CommandMetrics {
                commands_received: self.commands_received.load(Ordering::Relaxed),
                commands_processed: self.commands_processed.load(Ordering::Relaxed),
                commands_failed: self.commands_failed.load(Ordering::Relaxed),
                commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_agent_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub pipeline: PipelineMetrics,
    pub mqtt: MqttMetrics,
    pub commands: CommandMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct PipelineMetrics {
    pub readings_acquired: u64,
    pub readings_failed: u64,
    pub measurements_persisted: u64,
    pub measurements_uploaded: u64,
    pub measurements_flushed: u64,
    pub cycles_completed: u64,
    pub avg_cycle_time_ms: f64,
    pub max_cycle_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct CommandMetrics {
    pub commands_received: u64,
    pub commands_processed: u64,
    pub commands_failed: u64,
    pub commands_rejected: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
