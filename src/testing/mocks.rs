//! Mock implementations for testing
//!
//! Mock Transport and Sensor implementations so pipeline behavior can be
//! tested without a broker or an attached scale. History logs and control
//! handles are `Arc`-shared, so tests keep a handle even after the mock
//! moves into the agent.

use crate::protocol::{MeasurementPayload, StatusMessage};
use crate::sensor::{Sensor, SensorError};
use crate::transport::{mqtt::ConnectionState, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

pub type PublishedMessage = (String, Vec<u8>);

#[derive(Debug, Error)]
#[error("mock transport failure: {0}")]
pub struct MockTransportError(pub String);

/// Mock transport for testing
///
/// Connection state is a real watch channel, so agents observe reconnects
/// the same way they would with the MQTT link. Publishes error while the
/// state is not `Connected`, or whenever the failure flag is set.
pub struct MockTransport {
    pub published_measurements: Arc<Mutex<Vec<MeasurementPayload>>>,
    pub published_statuses: Arc<Mutex<Vec<StatusMessage>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub command_sender: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    fail_publishes: Arc<AtomicBool>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("mock idle".to_string()));
        Self {
            published_measurements: Arc::new(Mutex::new(Vec::new())),
            published_statuses: Arc::new(Mutex::new(Vec::new())),
            published_messages: Arc::new(Mutex::new(Vec::new())),
            command_sender: Arc::new(Mutex::new(None)),
            fail_publishes: Arc::new(AtomicBool::new(false)),
            state_tx,
            state_rx,
        }
    }

    /// A mock that starts out connected.
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.set_state(ConnectionState::Connected);
        transport
    }

    /// Drive the connection state; tests use the returned handle from
    /// [`MockTransport::state_handle`] after the mock has been moved.
    pub fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn state_handle(&self) -> watch::Sender<ConnectionState> {
        self.state_tx.clone()
    }

    /// Make publish calls fail until cleared.
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn failure_handle(&self) -> Arc<AtomicBool> {
        self.fail_publishes.clone()
    }

    /// Inject a raw command payload as if it arrived from the broker.
    ///
    /// Returns false when no command sender has been wired up yet.
    pub async fn send_command(&self, raw: Vec<u8>) -> bool {
        let sender = self.command_sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(raw).await.is_ok(),
            None => false,
        }
    }

    pub async fn get_published_measurements(&self) -> Vec<MeasurementPayload> {
        self.published_measurements.lock().await.clone()
    }

    pub async fn get_published_statuses(&self) -> Vec<StatusMessage> {
        self.published_statuses.lock().await.clone()
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_measurements.lock().await.clear();
        self.published_statuses.lock().await.clear();
        self.published_messages.lock().await.clear();
    }

    fn check_ready(&self) -> Result<(), MockTransportError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(MockTransportError("publish failure".to_string()));
        }
        if !self.is_connected() {
            return Err(MockTransportError("not connected".to_string()));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.set_state(ConnectionState::Disconnected("mock disconnected".to_string()));
        Ok(())
    }

    async fn publish_measurement(&self, payload: &MeasurementPayload) -> Result<(), Self::Error> {
        self.check_ready()?;
        self.published_measurements.lock().await.push(payload.clone());
        Ok(())
    }

    async fn publish_status(&self, status: &StatusMessage) -> Result<(), Self::Error> {
        self.check_ready()?;
        self.published_statuses.lock().await.push(status.clone());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        self.check_ready()?;
        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn set_command_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        *self.command_sender.lock().await = Some(sender);
    }
}

/// Mock sensor that replays a scripted sequence of read results
///
/// An exhausted script keeps returning [`SensorError::Timeout`], which is
/// what a silent scale looks like to the acquisition loop.
pub struct MockSensor {
    script: VecDeque<Result<Vec<u8>, SensorError>>,
    pub closed: bool,
}

impl MockSensor {
    pub fn with_script(script: Vec<Result<Vec<u8>, SensorError>>) -> Self {
        Self {
            script: script.into(),
            closed: false,
        }
    }

    /// Sensor that yields the given frames in order, then goes silent.
    pub fn with_frames(frames: &[&[u8]]) -> Self {
        Self::with_script(frames.iter().map(|f| Ok(f.to_vec())).collect())
    }

    /// Sensor that never produces a frame.
    pub fn silent() -> Self {
        Self::with_script(Vec::new())
    }
}

#[async_trait]
impl Sensor for MockSensor {
    async fn read_frame(&mut self) -> Result<Vec<u8>, SensorError> {
        self.script
            .pop_front()
            .unwrap_or(Err(SensorError::Timeout))
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_publishes_when_connected() {
        let mut transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        let status = StatusMessage::online("scale-test");
        transport.publish_status(&status).await.unwrap();
        assert_eq!(transport.get_published_statuses().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_rejects_publishes_when_disconnected() {
        let transport = MockTransport::new();

        let status = StatusMessage::online("scale-test");
        let result = transport.publish_status(&status).await;
        assert!(result.is_err());
        assert!(transport.get_published_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_mock_transport_failure_flag() {
        let transport = MockTransport::connected();
        transport.set_publish_failure(true);

        let status = StatusMessage::online("scale-test");
        assert!(transport.publish_status(&status).await.is_err());

        transport.set_publish_failure(false);
        assert!(transport.publish_status(&status).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_transport_state_handle_survives_move() {
        let transport = MockTransport::connected();
        let handle = transport.state_handle();
        let watch = transport.state_watch();

        let moved = transport;
        handle
            .send(ConnectionState::Reconnecting(1))
            .unwrap();

        assert!(!moved.is_connected());
        assert_eq!(*watch.borrow(), ConnectionState::Reconnecting(1));
    }

    #[tokio::test]
    async fn test_mock_transport_forwards_commands() {
        let transport = MockTransport::connected();
        let (tx, mut rx) = mpsc::channel(4);
        transport.set_command_sender(tx).await;

        assert!(transport.send_command(b"{}".to_vec()).await);
        assert_eq!(rx.recv().await.unwrap(), b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_mock_sensor_replays_script_then_times_out() {
        let mut sensor = MockSensor::with_frames(&[b"wn0012.34kg\r\n"]);

        assert_eq!(sensor.read_frame().await.unwrap(), b"wn0012.34kg\r\n");
        assert!(matches!(
            sensor.read_frame().await,
            Err(SensorError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_mock_sensor_close_marks_flag() {
        let mut sensor = MockSensor::silent();
        sensor.close().await.unwrap();
        assert!(sensor.closed);
    }
}
