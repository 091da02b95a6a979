//! Serial-attached scale
//!
//! The scale sits on an RS-232 line at a low baud rate and emits one frame
//! per second or so while a load is on the platter. Reads are plain blocking
//! `serialport` calls pushed onto the blocking pool, with the port's own
//! timeout as the bound.

use async_trait::async_trait;
use serialport::SerialPort;
use std::io::Read;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

use super::{FrameBuffer, Sensor, SensorError};

/// Per-read timeout on the port itself.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Scale attached over a serial line, 8N1 framing.
pub struct SerialSensor {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
    frames: FrameBuffer,
}

impl SerialSensor {
    /// Open the port. Failing to open is a startup error for the cycle that
    /// requested it, not a process fault.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, SensorError> {
        info!(port = port_name, baud = baud_rate, "opening serial port");

        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open()
            .map_err(|source| SensorError::SerialOpen {
                port: port_name.to_string(),
                source,
            })?;

        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
            frames: FrameBuffer::new(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait]
impl Sensor for SerialSensor {
    /// One buffered frame if available, otherwise one bounded blocking read.
    /// Partial lines stay buffered, so a frame split across reads completes
    /// on the caller's next attempt.
    async fn read_frame(&mut self) -> Result<Vec<u8>, SensorError> {
        if let Some(frame) = self.frames.next_frame() {
            return Ok(frame);
        }

        let mut port = self.port.take().ok_or(SensorError::Closed)?;
        let (port, read_result) = task::spawn_blocking(move || {
            let mut chunk = [0u8; 64];
            let result = port.read(&mut chunk).map(|n| chunk[..n].to_vec());
            (port, result)
        })
        .await
        .map_err(|_| SensorError::Closed)?;
        self.port = Some(port);

        match read_result {
            Ok(bytes) if bytes.is_empty() => Err(SensorError::Timeout),
            Ok(bytes) => {
                debug!(port = %self.port_name, bytes = bytes.len(), "serial chunk received");
                self.frames.extend(&bytes);
                self.frames.next_frame().ok_or(SensorError::Timeout)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(SensorError::Timeout),
            Err(e) => Err(SensorError::SerialRead(e)),
        }
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        if self.port.take().is_some() {
            info!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }
}
