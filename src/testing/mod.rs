//! Test support utilities
//!
//! Mock transport and sensor implementations for exercising the pipeline
//! without an MQTT broker or attached hardware.

pub mod mocks;

pub use mocks::{MockSensor, MockTransport, MockTransportError, PublishedMessage};
