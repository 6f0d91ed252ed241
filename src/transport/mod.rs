//! The UDP datagram transport contract.
//!
//! This is deliberately a thin adapter: send/queue/receive/peer-RTT
//! primitives only. The session core never touches a socket directly,
//! only this trait, so a host can substitute its own transport (a
//! simulated one for tests, a QoS-aware one in production) without the
//! handshake or frame-exchange code changing.

mod loopback;
mod udp;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{endpoint::Endpoint, error::Result};

pub use loopback::LoopbackTransport;
pub use udp::UdpTransport;

/// The transport's own estimate of a peer's connection quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    /// Exponentially-averaged round-trip time, in milliseconds.
    pub rtt_avg_ms: u32,
}

/// Receives decoded-at-the-datagram-level (still raw bytes; the control
/// message codec is layered on top by the session) inbound messages.
/// Installed once via [`Transport::set_receive_handler`] and invoked on
/// the transport's own I/O task for every inbound datagram.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, from: Endpoint, bytes: Bytes);
}

/// Invoked for transport-level failures. Logged, not fatal — the
/// handshake's own timeout is the authority on whether the session gives
/// up.
pub type ErrorHandler = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// Required operations over an unreliable UDP datagram channel. All
/// operations are non-blocking unless documented otherwise.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Binds the UDP socket and starts `worker_count` I/O tasks.
    async fn start(&self, port: u16, worker_count: usize) -> Result<()>;

    /// Unbinds the socket and stops all I/O tasks.
    async fn stop(&self);

    /// Appends `bytes` to the per-endpoint outbound queue. Does not send.
    fn queue(&self, to: Endpoint, bytes: Bytes);

    /// Flushes the outbound queue for `to`. Returns the number of
    /// messages still pending after the flush (0 means everything was
    /// handed to the socket successfully).
    async fn send(&self, to: Endpoint) -> usize;

    /// Test hook: flush `to`'s queue after injecting `delay_ms` of
    /// latency and dropping roughly `loss_permille`/1000 of datagrams.
    async fn send_with_jitter(&self, to: Endpoint, delay_ms: u32, loss_permille: u32) -> usize;

    /// The transport's current RTT estimate for `peer`.
    fn peer_stats(&self, peer: Endpoint) -> PeerStats;

    /// Installs the handler invoked for every decoded inbound datagram.
    /// Replacing the handler takes effect for the next inbound datagram;
    /// it does not preempt one already in flight.
    fn set_receive_handler(&self, handler: Arc<dyn InboundHandler>);

    /// Installs the handler invoked for transport-level errors.
    fn set_error_handler(&self, handler: ErrorHandler);
}
