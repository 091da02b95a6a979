//! Sensor transports that deliver raw frames off the scale
//!
//! Both attachment types put the same line-delimited ASCII on the air; only
//! the plumbing differs. Each transport enforces its own per-attempt timeout
//! so a wedged link can never hang the acquisition cycle.

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;

pub mod ble;
pub mod serial;

pub use ble::BleSensor;
pub use serial::SerialSensor;

/// Sensor transport failures
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("failed to open serial port {port}: {source}")]
    SerialOpen {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial read failed: {0}")]
    SerialRead(std::io::Error),
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("peripheral {0} not found during scan")]
    PeripheralNotFound(String),
    #[error("notify characteristic {0} not found on peripheral")]
    CharacteristicNotFound(uuid::Uuid),
    #[error("no complete frame within the read timeout")]
    Timeout,
    #[error("sensor transport closed")]
    Closed,
}

/// One attached scale, read frame by frame.
///
/// `read_frame` is bounded by the transport's own timeout and returns
/// [`SensorError::Timeout`] when no complete frame arrived in this attempt;
/// partial input stays buffered for the next attempt.
#[async_trait]
pub trait Sensor: Send {
    async fn read_frame(&mut self) -> Result<Vec<u8>, SensorError>;

    /// Orderly release of the underlying transport. Dropping the sensor
    /// releases OS handles too; radio links use this to disconnect cleanly.
    async fn close(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
}

#[async_trait]
impl Sensor for Box<dyn Sensor> {
    async fn read_frame(&mut self) -> Result<Vec<u8>, SensorError> {
        (**self).read_frame().await
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        (**self).close().await
    }
}

/// Bytes buffered past this point without a newline are stale garbage from a
/// warming-up sensor and get dropped. Real frames are ~11 bytes.
const MAX_BUFFERED_BYTES: usize = 1024;

/// Reassembles line-delimited frames from arbitrarily chunked input.
///
/// Serial reads and BLE notifications both hand over byte chunks that may
/// split or merge frames; this buffer cuts them back into lines.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFERED_BYTES && !self.buf.contains(&b'\n') {
            self.buf.clear();
        }
    }

    /// Pop the next complete frame, line terminators stripped.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let newline = self.buf.iter().position(|&b| b == b'\n')?;
        let mut frame = self.buf.split_to(newline + 1);
        while matches!(frame.last(), Some(b'\n') | Some(b'\r')) {
            frame.truncate(frame.len() - 1);
        }
        Some(frame.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_line_in_one_chunk() {
        let mut frames = FrameBuffer::new();
        frames.extend(b"wn0012.34kg\r\n");

        assert_eq!(frames.next_frame().as_deref(), Some(&b"wn0012.34kg"[..]));
        assert_eq!(frames.next_frame(), None);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut frames = FrameBuffer::new();
        frames.extend(b"wn00");
        assert_eq!(frames.next_frame(), None);

        frames.extend(b"12.34kg\r\n");
        assert_eq!(frames.next_frame().as_deref(), Some(&b"wn0012.34kg"[..]));
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut frames = FrameBuffer::new();
        frames.extend(b"wn0001.00kg\nwn0002.00kg\n");

        assert_eq!(frames.next_frame().as_deref(), Some(&b"wn0001.00kg"[..]));
        assert_eq!(frames.next_frame().as_deref(), Some(&b"wn0002.00kg"[..]));
        assert_eq!(frames.next_frame(), None);
    }

    #[test]
    fn test_blank_line_yields_empty_frame() {
        let mut frames = FrameBuffer::new();
        frames.extend(b"\r\nwn0001.00kg\n");

        assert_eq!(frames.next_frame().as_deref(), Some(&b""[..]));
        assert_eq!(frames.next_frame().as_deref(), Some(&b"wn0001.00kg"[..]));
    }

    #[test]
    fn test_unterminated_garbage_is_bounded() {
        let mut frames = FrameBuffer::new();
        frames.extend(&vec![b'x'; 2 * MAX_BUFFERED_BYTES]);

        assert_eq!(frames.next_frame(), None);
        // Buffer was reset; a fresh frame still comes through whole.
        frames.extend(b"wn0001.00kg\n");
        assert_eq!(frames.next_frame().as_deref(), Some(&b"wn0001.00kg"[..]));
    }
}
