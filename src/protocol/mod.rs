//! Wire types for the session's control channel.

pub mod message;
pub mod payload;

pub use message::ControlMessage;
pub use payload::{ControllerInput, Fingerprint, Payload};
