//! Impure I/O for the MQTT link
//!
//! Owns the rumqttc client, the reconnect supervisor task, and the watch
//! channel that announces connection state to the rest of the agent. The
//! supervisor is the only writer of the state channel.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::message_handler::{AckRegistry, CommandForwarder, EventRoute, MessageHandler};
use crate::config::DeviceConfig;
use crate::observability::metrics::METRICS;
use crate::protocol::{MeasurementPayload, StatusMessage, TopicScheme};
use crate::transport::Transport;
use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// MQTT transport for the telemetry pipeline
///
/// One instance per process. Reconnection runs forever in a background
/// supervisor; the link only stops on an explicit [`disconnect`] call.
///
/// [`disconnect`]: MqttLink::disconnect
pub struct MqttLink {
    device_id: String,
    topics: TopicScheme,
    config: DeviceConfig,
    reconnect: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    supervisor: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reset_tx: mpsc::Sender<String>,
    reset_rx: Option<mpsc::Receiver<String>>,
    acks: Arc<AckRegistry>,
    forwarder: Arc<CommandForwarder>,
}

impl MqttLink {
    /// Build the link from the device configuration.
    ///
    /// Reads the mTLS material eagerly so a missing certificate fails at
    /// startup instead of on the first dial.
    pub fn new(config: &DeviceConfig) -> Result<Self, MqttError> {
        let options = configure_mqtt_options(config)?;
        let (client, event_loop) = AsyncClient::new(options, 10);

        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("not started".to_string()));
        let (reset_tx, reset_rx) = mpsc::channel(4);

        Ok(Self {
            device_id: config.device_id.clone(),
            topics: TopicScheme::new(&config.stage, &config.device_id),
            config: config.clone(),
            reconnect: ReconnectConfig::default(),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            supervisor: None,
            state_tx,
            state_rx,
            shutdown_tx: None,
            reset_tx,
            reset_rx: Some(reset_rx),
            acks: Arc::new(AckRegistry::new()),
            forwarder: Arc::new(CommandForwarder::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Start the link supervisor and wait for the first broker handshake.
    ///
    /// A timeout here is not fatal to the pipeline: the supervisor keeps
    /// dialing with backoff in the background, and measurements buffer in
    /// the store until the link comes up.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.take().ok_or(MqttError::AlreadyStarted)?;
        let reset_rx = self.reset_rx.take().ok_or(MqttError::AlreadyStarted)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = LinkSupervisor {
            device_id: self.device_id.clone(),
            topics: self.topics.clone(),
            config: self.config.clone(),
            reconnect: self.reconnect.clone(),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            acks: self.acks.clone(),
            forwarder: self.forwarder.clone(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run(event_loop, shutdown_rx, reset_rx)));

        Self::wait_for_connection(self.state_rx.clone(), self.reconnect.connect_timeout).await
    }

    /// Block until the supervisor reports `Connected`, bounded by `timeout`.
    async fn wait_for_connection(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let wait = async {
            loop {
                if state_rx.borrow_and_update().is_connected() {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "state channel closed".to_string(),
                    ));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailed(format!(
                "no broker acknowledgment within {timeout:?}"
            ))),
        }
    }

    /// Publish the offline status, stop the supervisor, and close the session.
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        // The last will only fires on ungraceful drops, so a clean shutdown
        // announces offline explicitly.
        let offline = StatusMessage::offline(&self.device_id);
        if let Err(e) = self.publish_status(&offline).await {
            debug!(error = %e, "offline status not published during shutdown");
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        {
            let client = self.client.lock().await;
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "broker disconnect raced the supervisor shutdown");
            }
        }

        if let Some(handle) = self.supervisor.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("link supervisor shut down"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "link supervisor ended with error")
                }
                Err(_) => warn!("link supervisor did not stop in time, aborting"),
                _ => {}
            }
        }

        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !state.is_connected() {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Publish one measurement to the telemetry topic, ack-awaited.
    pub async fn publish_measurement(&self, payload: &MeasurementPayload) -> Result<(), MqttError> {
        let body = serde_json::to_vec(payload)?;
        debug!(
            measurement_id = %payload.measurement_id,
            topic = %self.topics.measurements(),
            "publishing measurement"
        );
        self.publish_qos1(&self.topics.measurements(), body).await
    }

    /// Publish a status message to the status topic, ack-awaited.
    pub async fn publish_status(&self, status: &StatusMessage) -> Result<(), MqttError> {
        let body = serde_json::to_vec(status)?;
        self.publish_qos1(&self.topics.status(), body).await
    }

    /// At-least-once publish: returns `Ok` only after the broker's PubAck.
    ///
    /// On acknowledgment timeout the supervisor is nudged into a reconnect
    /// cycle, because a broker that accepts bytes without acknowledging them
    /// is indistinguishable from a dead link.
    async fn publish_qos1(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.check_connection_state()?;

        // Register before sending so the supervisor cannot process the
        // acknowledgment ahead of the waiter.
        let ack = self.acks.register().await;
        {
            let client = self.client.lock().await;
            client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
        }

        match tokio::time::timeout(self.reconnect.ack_timeout, ack).await {
            Ok(Ok(Ok(()))) => {
                METRICS.message_published();
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                METRICS.publish_failed();
                Err(MqttError::DeliveryFailed(reason))
            }
            Ok(Err(_)) => {
                METRICS.publish_failed();
                Err(MqttError::DeliveryFailed(
                    "link supervisor dropped the acknowledgment".to_string(),
                ))
            }
            Err(_) => {
                METRICS.publish_failed();
                let _ = self.reset_tx.try_send(format!(
                    "no acknowledgment within {:?}",
                    self.reconnect.ack_timeout
                ));
                Err(MqttError::AckTimeout(self.reconnect.ack_timeout))
            }
        }
    }

    /// Route inbound command payloads to the given channel.
    pub async fn set_command_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        self.forwarder.set_sender(sender).await;
    }
}

/// Implementation of the transport abstraction for the MQTT link
#[async_trait]
impl Transport for MqttLink {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttLink::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttLink::disconnect(self).await
    }

    async fn publish_measurement(&self, payload: &MeasurementPayload) -> Result<(), Self::Error> {
        MqttLink::publish_measurement(self, payload).await
    }

    async fn publish_status(&self, status: &StatusMessage) -> Result<(), Self::Error> {
        MqttLink::publish_status(self, status).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        self.publish_qos1(topic, payload).await
    }

    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    fn connection_state(&self) -> ConnectionState {
        MqttLink::connection_state(self)
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        MqttLink::state_watch(self)
    }

    async fn set_command_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        MqttLink::set_command_sender(self, sender).await;
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        // Graceful teardown needs async; callers use disconnect() for that.
    }
}

/// Background task driving the rumqttc event loop
///
/// Owns all writes to the connection state channel. On any failure it backs
/// off, swaps in a fresh client/event-loop pair, and dials again; the stable
/// client identifier resumes the durable broker session. Swapping the client
/// also discards rumqttc's in-flight retransmission state, so delivery
/// retries are driven solely by the measurement store.
struct LinkSupervisor {
    device_id: String,
    topics: TopicScheme,
    config: DeviceConfig,
    reconnect: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    acks: Arc<AckRegistry>,
    forwarder: Arc<CommandForwarder>,
}

impl LinkSupervisor {
    async fn run(
        self,
        event_loop: Arc<Mutex<EventLoop>>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut reset_rx: mpsc::Receiver<String>,
    ) {
        info!(device_id = %self.device_id, "link supervisor started");
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let mut current_event_loop = event_loop;
        let mut factor: u64 = 1;
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                Some(reason) = reset_rx.recv() => {
                    warn!(device_id = %self.device_id, reason = %reason, "link reset requested");
                    if !self.reconnect_pause(&mut factor, &mut attempt, &reason, &mut shutdown_rx).await {
                        break;
                    }
                    self.redial(&mut current_event_loop).await;
                }

                event = Self::poll(&current_event_loop) => {
                    match event {
                        Ok(event) => {
                            let route = MessageHandler::route_event(&event);
                            if let Some(reason) = self.handle_route(route, &mut factor, &mut attempt).await {
                                if !self.reconnect_pause(&mut factor, &mut attempt, &reason, &mut shutdown_rx).await {
                                    break;
                                }
                                self.redial(&mut current_event_loop).await;
                            }
                        }
                        Err(e) => {
                            METRICS.connection_lost();
                            let reason = e.to_string();
                            error!(device_id = %self.device_id, error = %reason, "event loop error");
                            if !self.reconnect_pause(&mut factor, &mut attempt, &reason, &mut shutdown_rx).await {
                                break;
                            }
                            self.redial(&mut current_event_loop).await;
                        }
                    }
                }
            }
        }

        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected("shutdown requested".to_string()));
        let _ = self.acks.fail_all("link shut down").await;
        info!(device_id = %self.device_id, "link supervisor stopped");
    }

    async fn poll(event_loop: &Arc<Mutex<EventLoop>>) -> Result<Event, rumqttc::ConnectionError> {
        let mut guard = event_loop.lock().await;
        guard.poll().await
    }

    /// React to one routed event. Returns a reason when the link must be
    /// re-dialed.
    async fn handle_route(
        &self,
        route: EventRoute,
        factor: &mut u64,
        attempt: &mut u32,
    ) -> Option<String> {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                info!(
                    device_id = %self.device_id,
                    session_present,
                    "broker session established"
                );
                METRICS.connection_established();
                *factor = 1;
                *attempt = 0;

                // Subscribe and announce before flipping the state so no
                // gated publish can slip in between and misalign the
                // acknowledgment pairing.
                self.resubscribe().await;
                self.announce_online().await;
                let _ = self.state_tx.send(ConnectionState::Connected);
                None
            }
            EventRoute::CommandReceived {
                topic,
                payload,
                retain,
            } => {
                METRICS.message_received();
                let expected = self.topics.commands();
                if MessageHandler::should_forward_command(&topic, retain, &expected) {
                    if let Err(e) = self.forwarder.forward(payload).await {
                        error!(error = %e, "failed to hand command to router");
                    }
                }
                None
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                if !self.acks.complete_next().await {
                    debug!(packet_id, "acknowledgment without a waiting publish");
                }
                None
            }
            EventRoute::Disconnected => Some("broker closed the session".to_string()),
            EventRoute::InfrastructureEvent(event) => {
                debug!(event = %event, "mqtt event");
                None
            }
            EventRoute::OutgoingEvent => None,
        }
    }

    /// Fail outstanding publishes, announce `Reconnecting`, and wait out the
    /// backoff delay. Returns false when shutdown interrupted the pause.
    async fn reconnect_pause(
        &self,
        factor: &mut u64,
        attempt: &mut u32,
        reason: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let failed = self.acks.fail_all(reason).await;
        if failed > 0 {
            warn!(failed, "outstanding publishes failed with the connection");
        }

        *attempt += 1;
        let _ = self.state_tx.send(ConnectionState::Reconnecting(*attempt));
        METRICS.reconnect_attempt();

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        let delay = self.reconnect.backoff_delay(*factor, jitter);
        *factor = ReconnectConfig::next_factor(*factor);

        info!(
            device_id = %self.device_id,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after backoff"
        );

        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Swap in a fresh client and event loop for the next dial.
    async fn redial(&self, current_event_loop: &mut Arc<Mutex<EventLoop>>) {
        let _ = self.state_tx.send(ConnectionState::Connecting);

        match configure_mqtt_options(&self.config) {
            Ok(options) => {
                let (client, event_loop) = AsyncClient::new(options, 10);
                *current_event_loop = Arc::new(Mutex::new(event_loop));
                *self.client.lock().await = client;
                debug!("fresh connection prepared");
            }
            Err(e) => {
                // Keep the old handles; the next poll fails and we back off
                // again.
                error!(error = %e, "could not prepare a fresh connection");
            }
        }
    }

    /// Subscribe to the command topic. Repeated on every ConnAck so a
    /// broker that lost the durable session still ends up subscribed.
    async fn resubscribe(&self) {
        let topic = self.topics.commands();
        let client = self.client.lock().await;
        match client.subscribe(&topic, QoS::AtLeastOnce).await {
            Ok(()) => info!(topic = %topic, "subscribed to command topic"),
            Err(e) => error!(topic = %topic, error = %e, "command subscription failed"),
        }
    }

    /// Publish the online status for this session.
    async fn announce_online(&self) {
        let status = StatusMessage::online(&self.device_id);
        let payload = match serde_json::to_vec(&status) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "could not encode online status");
                return;
            }
        };

        let published = {
            let client = self.client.lock().await;
            client
                .publish(self.topics.status(), QoS::AtLeastOnce, false, payload)
                .await
        };

        match published {
            // The status went out QoS 1, so its acknowledgment needs a slot
            // in the registry to keep the pairing aligned. Nobody waits on
            // it; the completion is discarded.
            Ok(()) => drop(self.acks.register().await),
            Err(e) => warn!(error = %e, "online status not published"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn config_with_certs() -> (DeviceConfig, TempDir) {
        let dir = TempDir::new().unwrap();
        for name in [
            crate::config::CA_FILE,
            crate::config::CERT_FILE,
            crate::config::KEY_FILE,
        ] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(b"-----BEGIN TEST-----\n").unwrap();
        }

        let mut config = DeviceConfig::test_config();
        config.certs_dir = dir.path().to_path_buf();
        (config, dir)
    }

    #[tokio::test]
    async fn new_link_fails_without_certificates() {
        let mut config = DeviceConfig::test_config();
        config.certs_dir = std::path::PathBuf::from("/nonexistent/certs");

        let result = MqttLink::new(&config);
        assert!(matches!(result, Err(MqttError::Certificate { .. })));
    }

    #[tokio::test]
    async fn initial_state_is_disconnected() {
        let (config, _certs) = config_with_certs();
        let link = MqttLink::new(&config).unwrap();

        assert!(!link.is_connected());
        assert!(matches!(
            link.connection_state(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn publish_fails_before_connect() {
        let (config, _certs) = config_with_certs();
        let link = MqttLink::new(&config).unwrap();

        let status = StatusMessage::online("scale-test");
        let result = link.publish_status(&status).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_clean() {
        let (config, _certs) = config_with_certs();
        let mut link = MqttLink::new(&config).unwrap();
        link.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn state_watch_tracks_the_channel() {
        let (config, _certs) = config_with_certs();
        let link = MqttLink::new(&config).unwrap();

        let watch = link.state_watch();
        assert!(matches!(
            *watch.borrow(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn wait_for_connection_resolves_on_connected() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);

        let waiter = tokio::spawn(MqttLink::wait_for_connection(
            rx,
            Duration::from_secs(1),
        ));
        tx.send(ConnectionState::Connected).unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_connection_times_out() {
        let (_tx, rx) = watch::channel(ConnectionState::Connecting);

        let result = MqttLink::wait_for_connection(rx, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(MqttError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn wait_for_connection_sees_preexisting_connected_state() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);

        MqttLink::wait_for_connection(rx, Duration::from_millis(50))
            .await
            .unwrap();
        drop(tx);
    }
}
