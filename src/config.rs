//! Session timing and test-hook knobs, read the way the teacher's
//! `setup::config` reads node configuration: a plain struct with sane
//! defaults, optionally overridden from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::session::Session`].
///
/// `SessionConfig::default()` reproduces the timing constants hardcoded in
/// the original `shoryu::session` (`examples/original_source/pcsx2/Netplay/shoryu/session.h`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// UDP worker task count passed to the transport's `start`.
    pub worker_count: usize,
    /// How often a joiner retransmits `Join` while waiting for `Info`/`Deny`.
    pub join_retry_interval_ms: u64,
    /// How many RTT probes a joiner sends before proposing a delay.
    pub ping_count: u32,
    /// Spacing between RTT probes.
    pub ping_interval_ms: u64,
    /// How often a joiner retransmits `Delay` while waiting for the host's echo.
    pub delay_retry_interval_ms: u64,
    /// Spacing between `Ready` retransmissions in the readiness barrier.
    pub ready_retry_interval_ms: u64,
    /// How long a creator's poll loop keeps checking the readiness barrier
    /// before giving up (bounded by the overall handshake timeout too).
    pub readiness_poll_interval_ms: u64,
    /// How long a peer's `Join` record stays eligible for the roster once
    /// seen.
    pub peer_join_ttl_ms: u64,

    /// Minimum artificial send delay applied by the session before handing
    /// a datagram to the transport.
    pub send_delay_min_ms: u32,
    /// Maximum artificial send delay. Clamped up to `send_delay_min_ms` if
    /// smaller, rather than left unchecked.
    pub send_delay_max_ms: u32,
    /// Packets dropped per 1000 sent, applied by the session on every send.
    pub packet_loss_permille: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            join_retry_interval_ms: 500,
            ping_count: 250,
            ping_interval_ms: 17,
            delay_retry_interval_ms: 50,
            ready_retry_interval_ms: 17,
            readiness_poll_interval_ms: 50,
            peer_join_ttl_ms: 1000,
            send_delay_min_ms: 0,
            send_delay_max_ms: 0,
            packet_loss_permille: 0,
        }
    }
}

impl SessionConfig {
    /// Loads a configuration from a TOML file, falling back to defaults
    /// for any key the file omits.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Clamps `send_delay_max_ms` up to `send_delay_min_ms` when the file
    /// (or a caller) set it inconsistently.
    pub fn normalized(mut self) -> Self {
        if self.send_delay_max_ms < self.send_delay_min_ms {
            self.send_delay_max_ms = self.send_delay_min_ms;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_constants() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.join_retry_interval_ms, 500);
        assert_eq!(cfg.ping_count, 250);
        assert_eq!(cfg.ping_interval_ms, 17);
        assert_eq!(cfg.delay_retry_interval_ms, 50);
        assert_eq!(cfg.peer_join_ttl_ms, 1000);
    }

    #[test]
    fn normalized_clamps_inverted_send_delay_range() {
        let cfg = SessionConfig {
            send_delay_min_ms: 50,
            send_delay_max_ms: 10,
            ..SessionConfig::default()
        }
        .normalized();
        assert_eq!(cfg.send_delay_max_ms, 50);
    }
}
