//! Scale wire protocol and broker message formats
//!
//! Frame decoding for the sensor side, JSON message shapes and topic layout
//! for the broker side.

pub mod frame;
pub mod messages;
pub mod topics;

pub use frame::*;
pub use messages::*;
pub use topics::*;
