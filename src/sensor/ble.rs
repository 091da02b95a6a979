//! BLE-attached scale
//!
//! The radio scales stream the same line-delimited frames over a notify
//! characteristic. The peripheral is found by MAC address during a bounded
//! scan, notifications are enabled on the weight characteristic, and frames
//! are cut out of the notification stream.

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, ValueNotification};
use btleplug::platform::{Manager, Peripheral};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use super::{FrameBuffer, Sensor, SensorError};

/// Notify characteristic carrying weight frames
/// (`0000ffe1-0000-1000-8000-00805f9b34fb`).
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// One scan window; the peripheral advertises every second or two.
const SCAN_WINDOW: Duration = Duration::from_secs(2);

/// Scan windows to try before giving up on finding the peripheral.
const SCAN_ATTEMPTS: usize = 5;

/// Per-attempt wait for a notification.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Scale attached over BLE, identified by its MAC address.
pub struct BleSensor {
    address: String,
    peripheral: Peripheral,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    frames: FrameBuffer,
}

impl BleSensor {
    /// Scan for the peripheral, connect, and enable weight notifications.
    pub async fn connect(address: &str) -> Result<Self, SensorError> {
        info!(address, "scanning for scale peripheral");

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SensorError::NoAdapter)?;

        adapter.start_scan(ScanFilter::default()).await?;
        let found = Self::find_peripheral(&adapter, address).await;
        adapter.stop_scan().await?;
        let peripheral = found.ok_or_else(|| SensorError::PeripheralNotFound(address.to_string()))?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == NOTIFY_CHARACTERISTIC)
            .ok_or(SensorError::CharacteristicNotFound(NOTIFY_CHARACTERISTIC))?;
        peripheral.subscribe(&characteristic).await?;

        let notifications = peripheral.notifications().await?;
        info!(address, "scale peripheral connected, notifications enabled");

        Ok(Self {
            address: address.to_string(),
            peripheral,
            notifications,
            frames: FrameBuffer::new(),
        })
    }

    async fn find_peripheral(
        adapter: &btleplug::platform::Adapter,
        address: &str,
    ) -> Option<Peripheral> {
        for _ in 0..SCAN_ATTEMPTS {
            sleep(SCAN_WINDOW).await;
            let peripherals = adapter.peripherals().await.ok()?;
            for peripheral in peripherals {
                if peripheral
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(address)
                {
                    return Some(peripheral);
                }
            }
            debug!(address, "peripheral not seen yet, scanning again");
        }
        None
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Sensor for BleSensor {
    /// One buffered frame if available, otherwise one bounded wait for the
    /// next notification. Split frames complete on a later attempt.
    async fn read_frame(&mut self) -> Result<Vec<u8>, SensorError> {
        if let Some(frame) = self.frames.next_frame() {
            return Ok(frame);
        }

        let notification = timeout(NOTIFY_TIMEOUT, self.notifications.next())
            .await
            .map_err(|_| SensorError::Timeout)?
            .ok_or(SensorError::Closed)?;

        if notification.uuid == NOTIFY_CHARACTERISTIC {
            debug!(
                address = %self.address,
                bytes = notification.value.len(),
                "notification received"
            );
            self.frames.extend(&notification.value);
        }

        self.frames.next_frame().ok_or(SensorError::Timeout)
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        if let Some(characteristic) = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == NOTIFY_CHARACTERISTIC)
        {
            // Best effort; the disconnect below tears the link down anyway.
            let _ = self.peripheral.unsubscribe(&characteristic).await;
        }
        self.peripheral.disconnect().await?;
        info!(address = %self.address, "scale peripheral disconnected");
        Ok(())
    }
}
