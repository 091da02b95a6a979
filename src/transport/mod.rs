//! Transport layer for broker communication
//!
//! This module provides the transport abstraction and its MQTT
//! implementation. The agent loop talks to the broker only through the
//! [`Transport`] trait so tests can drive it with an in-memory double.

use crate::protocol::{MeasurementPayload, StatusMessage};
use tokio::sync::{mpsc, watch};

pub mod mqtt;

pub use mqtt::ConnectionState;

/// Transport trait for broker communication
///
/// Implemented by the MQTT link for production and by a mock for tests.
/// All publishes are at-least-once: a call returns `Ok` only after the
/// broker has acknowledged the message.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker and start the link supervisor
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker and stop the link supervisor
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Publish one measurement to the telemetry topic
    async fn publish_measurement(&self, payload: &MeasurementPayload) -> Result<(), Self::Error>;

    /// Publish a status message to the status topic
    async fn publish_status(&self, status: &StatusMessage) -> Result<(), Self::Error>;

    /// Publish an arbitrary payload to the given topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// Check if the link is currently connected
    fn is_connected(&self) -> bool;

    /// Get the current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Watch connection state transitions (used to trigger pending flushes)
    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    /// Set the channel that receives raw command payloads from the broker
    async fn set_command_sender(&self, sender: mpsc::Sender<Vec<u8>>);
}

/// Type alias for the production MQTT transport
pub type MqttTransport = mqtt::MqttLink;
