//! Measurement pipeline orchestration
//!
//! The agent owns the acquisition cycle: read a frame from the scale,
//! persist the decoded measurement locally, then drain the store over the
//! MQTT link oldest-first. Persistence always happens before publication,
//! so a crash or broker outage never loses a decoded reading.
//!
//! Between cycles the agent sleeps on the sampling interval while staying
//! responsive to inbound commands, link state changes, and shutdown. A
//! restored connection triggers an immediate flush of the buffered backlog
//! instead of waiting for the next cycle.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::commands::CommandRouter;
use crate::config::{ConnectionType, DeviceConfig};
use crate::error::{AgentError, AgentResult};
use crate::observability::metrics::METRICS;
use crate::protocol::{FrameDecoder, Reading};
use crate::sensor::Sensor;
use crate::store::{Measurement, MeasurementStore};
use crate::transport::{ConnectionState, Transport};

/// Read attempts per cycle before the cycle is abandoned.
pub const ACQUIRE_ATTEMPTS: usize = 5;

/// Pause between consecutive read attempts within one cycle.
pub const ATTEMPT_PAUSE: Duration = Duration::from_millis(500);

/// How many buffered measurements to load per store scan while flushing.
const FLUSH_BATCH: usize = 50;

/// Depth of the inbound command queue. Commands arriving while a cycle is
/// in progress wait here until the agent sleeps again.
const COMMAND_QUEUE_DEPTH: usize = 16;

/// The measurement agent, wired over a transport and a sensor.
///
/// Generic over both so tests can drive the pipeline with mocks while
/// production runs the MQTT link against a serial or BLE scale.
pub struct Agent<T: Transport, S: Sensor> {
    config: DeviceConfig,
    transport: T,
    sensor: S,
    store: MeasurementStore,
    router: CommandRouter,
    decoder: FrameDecoder,
    interval_rx: watch::Receiver<Duration>,
    // Held so the command channel never closes while the agent runs.
    command_tx: mpsc::Sender<Vec<u8>>,
    command_rx: mpsc::Receiver<Vec<u8>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport, S: Sensor> Agent<T, S> {
    pub fn new(config: DeviceConfig, transport: T, sensor: S) -> Self {
        let store = MeasurementStore::new(config.store_dir.clone());
        let (interval_tx, interval_rx) = watch::channel(config.sampling_interval());
        let router = CommandRouter::new(&config.device_id, interval_tx);
        let decoder = match config.connection_type {
            ConnectionType::Serial => FrameDecoder::serial(),
            ConnectionType::Radio => FrameDecoder::radio(),
        };
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_rx = transport.state_watch();

        Self {
            config,
            transport,
            sensor,
            store,
            router,
            decoder,
            interval_rx,
            command_tx,
            command_rx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Wire up command delivery and bring the link online.
    ///
    /// A broker that cannot be reached right now is not fatal: the link
    /// supervisor keeps retrying in the background and measurements buffer
    /// locally until it succeeds.
    pub async fn start(&mut self) {
        self.transport
            .set_command_sender(self.command_tx.clone())
            .await;

        METRICS.set_agent_state("connecting");
        info!(device_id = %self.config.device_id, "starting agent");

        if let Err(e) = self.transport.connect().await {
            warn!(
                error = %e,
                "broker not reachable yet, measurements will buffer locally"
            );
        }

        METRICS.set_agent_state("running");
    }

    /// Run measurement cycles until shutdown is requested.
    pub async fn run(&mut self) {
        info!(
            interval_secs = self.interval_rx.borrow().as_secs(),
            "measurement loop started"
        );

        loop {
            let started = Instant::now();
            self.cycle().await;
            METRICS.cycle_completed(started.elapsed());

            if !self.sleep_between_cycles().await {
                break;
            }
        }

        METRICS.set_agent_state("stopping");
        info!("measurement loop stopped");
    }

    /// Execute exactly one measurement cycle.
    pub async fn run_once(&mut self) {
        let started = Instant::now();
        self.cycle().await;
        METRICS.cycle_completed(started.elapsed());
    }

    /// One cycle: acquire, persist, then drain everything unsent.
    ///
    /// The fresh measurement is not published directly. It goes through the
    /// same oldest-first flush as any buffered backlog, which keeps uploads
    /// in acquisition order even right after an outage.
    pub async fn cycle(&mut self) {
        match self.acquire_reading().await {
            Ok(reading) => {
                METRICS.reading_acquired();
                let measurement = Measurement::from_reading(&self.config.device_id, &reading);
                debug!(
                    value = %measurement.value,
                    unit = %measurement.unit,
                    "reading decoded"
                );

                if let Err(e) = self.store.append(&measurement).await {
                    METRICS.reading_failed();
                    error!(error = %e, "failed to persist measurement, dropping reading");
                    return;
                }
                METRICS.measurement_persisted();
            }
            Err(e) => {
                METRICS.reading_failed();
                warn!(error = %e, "no reading this cycle");
            }
        }

        self.flush_pending().await;
    }

    /// Deliver buffered measurements oldest-first while the link is up.
    ///
    /// Stops at the first publish failure and leaves the rest buffered; the
    /// next cycle or reconnect picks them up again. Returns how many records
    /// were delivered and marked uploaded.
    pub async fn flush_pending(&self) -> u64 {
        if !self.transport.is_connected() {
            return 0;
        }

        let mut delivered = 0u64;
        loop {
            let batch = match self.store.pending_unsent(FLUSH_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to scan for buffered measurements");
                    return delivered;
                }
            };
            if batch.is_empty() {
                return delivered;
            }

            for measurement in &batch {
                let payload = measurement.payload();
                if let Err(e) = self.transport.publish_measurement(&payload).await {
                    warn!(
                        error = %e,
                        measurement_id = %payload.measurement_id,
                        "publish failed, measurement stays buffered"
                    );
                    return delivered;
                }

                // An unmarked record would be re-published next flush. The
                // cloud de-duplicates on measurement_id, but stop here
                // anyway rather than loop over a store that rejects writes.
                if let Err(e) = self.store.mark_uploaded(measurement.timestamp).await {
                    error!(
                        error = %e,
                        measurement_id = %measurement.measurement_id,
                        "delivered measurement could not be marked uploaded"
                    );
                    return delivered;
                }

                METRICS.measurement_uploaded();
                delivered += 1;
            }
        }
    }

    /// Request shutdown from another task, e.g. a signal handler.
    pub fn shutdown_trigger(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// The sampling interval currently in effect.
    pub fn sampling_interval(&self) -> Duration {
        *self.interval_rx.borrow()
    }

    /// Release the sensor and take the link down cleanly.
    pub async fn shutdown(&mut self) {
        info!("shutting down agent");
        METRICS.set_agent_state("stopping");

        if let Err(e) = self.sensor.close().await {
            debug!(error = %e, "sensor close reported an error");
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport disconnect reported an error");
        }

        METRICS.set_agent_state("stopped");
    }

    /// Read frames until one decodes, up to [`ACQUIRE_ATTEMPTS`] tries.
    async fn acquire_reading(&mut self) -> AgentResult<Reading> {
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            match self.sensor.read_frame().await {
                Ok(frame) => match self.decoder.decode(&frame) {
                    Ok(reading) => return Ok(reading),
                    Err(e) => {
                        debug!(attempt, error = %e, "frame did not decode");
                    }
                },
                Err(e) => {
                    debug!(attempt, error = %e, "sensor read failed");
                }
            }
            if attempt < ACQUIRE_ATTEMPTS {
                tokio::time::sleep(ATTEMPT_PAUSE).await;
            }
        }
        Err(AgentError::NoReading {
            attempts: ACQUIRE_ATTEMPTS,
        })
    }

    /// Sleep out the sampling interval while servicing the channels.
    ///
    /// Returns false once shutdown has been requested. An interval change
    /// reschedules the in-progress sleep from now; a link recovery flushes
    /// the backlog immediately.
    async fn sleep_between_cycles(&mut self) -> bool {
        let interval = *self.interval_rx.borrow();
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,

                Ok(()) = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow_and_update() {
                        info!("shutdown requested");
                        return false;
                    }
                }

                Some(raw) = self.command_rx.recv() => {
                    self.handle_command(&raw).await;
                }

                Ok(()) = self.interval_rx.changed() => {
                    let interval = *self.interval_rx.borrow_and_update();
                    info!(
                        interval_secs = interval.as_secs(),
                        "sampling interval changed, rescheduling"
                    );
                    sleep.as_mut().reset(Instant::now() + interval);
                }

                Ok(()) = self.state_rx.changed() => {
                    if self.state_rx.borrow().is_connected() {
                        let flushed = self.flush_pending().await;
                        if flushed > 0 {
                            METRICS.measurements_flushed(flushed);
                            info!(
                                count = flushed,
                                "link restored, buffered measurements delivered"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Route one raw command payload and publish its acknowledgment.
    async fn handle_command(&self, raw: &[u8]) {
        if let Some(ack) = self.router.handle(raw) {
            if let Err(e) = self.transport.publish_status(&ack).await {
                warn!(error = %e, "failed to publish command acknowledgment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSensor, MockTransport};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    const FRAME: &[u8] = b"wn0012.34kg\r\n";

    fn test_setup() -> (DeviceConfig, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = DeviceConfig::test_config();
        config.store_dir = dir.path().to_path_buf();
        (config, dir)
    }

    fn buffered_measurement(device_id: &str, stamp: (u32, u32, u32)) -> Measurement {
        let timestamp = Utc
            .with_ymd_and_hms(2024, 6, 1, stamp.0, stamp.1, stamp.2)
            .unwrap();
        Measurement {
            measurement_id: format!("{device_id}-{}", timestamp.timestamp()),
            device_id: device_id.to_string(),
            value: "70.5".parse().unwrap(),
            unit: "kg".to_string(),
            timestamp,
            uploaded: false,
        }
    }

    #[tokio::test]
    async fn test_cycle_persists_then_publishes_and_marks_uploaded() {
        let (config, dir) = test_setup();
        let transport = MockTransport::connected();
        let published = transport.published_measurements.clone();

        let mut agent = Agent::new(config, transport, MockSensor::with_frames(&[FRAME]));
        agent.cycle().await;

        let published = published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].weight, "12.34".parse::<Decimal>().unwrap());
        assert_eq!(published[0].device_id, "test-scale");

        let store = MeasurementStore::new(dir.path());
        assert!(store.pending_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_measurement_buffered() {
        let (config, dir) = test_setup();
        let transport = MockTransport::connected();
        transport.set_publish_failure(true);
        let published = transport.published_measurements.clone();
        let failure = transport.failure_handle();

        let mut agent = Agent::new(config, transport, MockSensor::with_frames(&[FRAME]));
        agent.cycle().await;

        assert!(published.lock().await.is_empty());
        let store = MeasurementStore::new(dir.path());
        assert_eq!(store.pending_unsent(10).await.unwrap().len(), 1);

        // Once publishing works again a flush delivers the backlog.
        failure.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(agent.flush_pending().await, 1);
        assert_eq!(published.lock().await.len(), 1);
        assert!(store.pending_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_cycle_buffers_without_publishing() {
        let (config, dir) = test_setup();
        let transport = MockTransport::new();
        let published = transport.published_measurements.clone();

        let mut agent = Agent::new(config, transport, MockSensor::with_frames(&[FRAME]));
        agent.cycle().await;

        assert!(published.lock().await.is_empty());
        let store = MeasurementStore::new(dir.path());
        assert_eq!(store.pending_unsent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_delivers_backlog_oldest_first() {
        let (config, dir) = test_setup();
        let store = MeasurementStore::new(dir.path());
        store
            .append(&buffered_measurement("test-scale", (10, 0, 2)))
            .await
            .unwrap();
        store
            .append(&buffered_measurement("test-scale", (10, 0, 0)))
            .await
            .unwrap();
        store
            .append(&buffered_measurement("test-scale", (10, 0, 1)))
            .await
            .unwrap();

        let transport = MockTransport::connected();
        let published = transport.published_measurements.clone();

        let agent = Agent::new(config, transport, MockSensor::silent());
        assert_eq!(agent.flush_pending().await, 3);

        let published = published.lock().await;
        let timestamps: Vec<_> = published.iter().map(|p| p.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_sensor_exhausts_attempts_without_persisting() {
        let (config, dir) = test_setup();
        let transport = MockTransport::connected();
        let published = transport.published_measurements.clone();

        let mut agent = Agent::new(config, transport, MockSensor::silent());
        agent.cycle().await;

        assert!(published.lock().await.is_empty());
        let store = MeasurementStore::new(dir.path());
        assert!(store.pending_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frames_retry_until_a_good_one() {
        let (config, _dir) = test_setup();
        let transport = MockTransport::connected();
        let published = transport.published_measurements.clone();

        let sensor = MockSensor::with_frames(&[b"garbage", b"sg0001.00kg\r\n", FRAME]);
        let mut agent = Agent::new(config, transport, sensor);
        agent.cycle().await;

        // The serial decoder skips the garbage and the radio-prefixed frame.
        let published = published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].weight, "12.34".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn test_command_ack_is_published_and_interval_applied() {
        let (config, _dir) = test_setup();
        let transport = MockTransport::connected();
        let statuses = transport.published_statuses.clone();

        let agent = Agent::new(config, transport, MockSensor::silent());
        agent
            .handle_command(br#"{"action": "set_sampling_rate", "rate": "fast"}"#)
            .await;

        let statuses = statuses.lock().await;
        assert_eq!(statuses.len(), 1);
        assert!(matches!(
            statuses[0].status,
            crate::protocol::StatusKind::Success
        ));
        assert_eq!(statuses[0].sampling_interval_secs, Some(60));
        assert_eq!(agent.sampling_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_malformed_command_gets_no_ack() {
        let (config, _dir) = test_setup();
        let transport = MockTransport::connected();
        let statuses = transport.published_statuses.clone();

        let agent = Agent::new(config, transport, MockSensor::silent());
        agent.handle_command(b"{ not json").await;

        assert!(statuses.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_command_reschedules_sleep_in_progress() {
        let (mut config, _dir) = test_setup();
        config.sampling_interval_secs = 3600;
        let transport = MockTransport::connected();

        let mut agent = Agent::new(config, transport, MockSensor::silent());
        agent
            .command_tx
            .send(br#"{"action": "set_sampling_rate", "rate": "10"}"#.to_vec())
            .await
            .unwrap();

        let started = Instant::now();
        assert!(agent.sleep_between_cycles().await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let (config, _dir) = test_setup();
        let transport = MockTransport::connected();

        let mut agent = Agent::new(config, transport, MockSensor::silent());
        let trigger = agent.shutdown_trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = trigger.send(true);
        });

        let started = Instant::now();
        assert!(!agent.sleep_between_cycles().await);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_sleep_flushes_backlog() {
        let (config, dir) = test_setup();
        let store = MeasurementStore::new(dir.path());
        store
            .append(&buffered_measurement("test-scale", (9, 30, 0)))
            .await
            .unwrap();

        let transport = MockTransport::new();
        let published = transport.published_measurements.clone();
        let state = transport.state_handle();

        let mut agent = Agent::new(config, transport, MockSensor::silent());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = state.send(ConnectionState::Connected);
        });

        assert!(agent.sleep_between_cycles().await);
        assert_eq!(published.lock().await.len(), 1);
        assert!(store.pending_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_wires_command_sender_and_connects() {
        let (config, _dir) = test_setup();
        let transport = MockTransport::new();
        let sender_slot = transport.command_sender.clone();
        let state = transport.state_watch();

        let mut agent = Agent::new(config, transport, MockSensor::silent());
        agent.start().await;

        assert!(sender_slot.lock().await.is_some());
        assert!(state.borrow().is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sensor_and_disconnects() {
        let (config, _dir) = test_setup();
        let transport = MockTransport::connected();
        let state = transport.state_watch();

        let mut agent = Agent::new(config, transport, MockSensor::silent());
        agent.shutdown().await;

        assert!(!state.borrow().is_connected());
    }
}
