//! Peer-to-peer lockstep networking session layer for deterministic
//! emulators: a join/create handshake, RTT-based delay negotiation, and a
//! concurrent per-side frame exchange over a host-supplied UDP transport.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::SessionConfig;
pub use endpoint::Endpoint;
pub use error::{Result, SessionError};
pub use protocol::{ControlMessage, ControllerInput, Fingerprint, Payload};
pub use session::{state::SessionState, Session};
pub use transport::{Transport, UdpTransport};
