//! Handshake bookkeeping types and the pure roster-building logic used by
//! the create-side protocol.
//!
//! The actual drivers (`Session::create`/`Session::join` and the receive
//! dispatch) live in `session::mod` since they need the session's shared
//! locks, transport handle and frame exchange; this module holds the
//! state they thread through and the logic worth testing in isolation.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::endpoint::Endpoint;

/// Which phase of the handshake a peer was last observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Join,
    Delay,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub phase: PeerPhase,
    pub last_seen: Instant,
    pub reported_delay: u8,
}

/// Create-side handshake state. A `BTreeMap` keyed on `Endpoint` gives a
/// deterministic iteration order when rebuilding the roster candidate list,
/// matching the original's use of an ordered map, and naturally collapses
/// retransmissions from the same peer into a single entry.
#[derive(Debug, Default)]
pub struct CreateBookkeeping {
    pub peers: BTreeMap<Endpoint, PeerRecord>,
    pub players_needed: usize,
}

impl CreateBookkeeping {
    pub fn new(players_needed: usize) -> Self {
        Self {
            peers: BTreeMap::new(),
            players_needed,
        }
    }

    /// Records or refreshes a `Join` from `ep`.
    pub fn record_join(&mut self, ep: Endpoint, now: Instant) {
        self.peers
            .entry(ep)
            .and_modify(|r| r.last_seen = now)
            .or_insert(PeerRecord {
                phase: PeerPhase::Join,
                last_seen: now,
                reported_delay: 0,
            });
    }

    /// Records a `Delay` report from `ep`, overwriting any earlier report
    /// from the same endpoint. Keying by endpoint rather than appending to
    /// a list means a peer that retransmits its proposal while others are
    /// still catching up is only ever counted once toward the quorum.
    pub fn record_delay(&mut self, ep: Endpoint, delay: u8, now: Instant) {
        self.peers.insert(
            ep,
            PeerRecord {
                phase: PeerPhase::Delay,
                last_seen: now,
                reported_delay: delay,
            },
        );
    }

    /// Counts distinct peers currently in `Delay` phase.
    pub fn delay_reporters(&self) -> usize {
        self.peers
            .values()
            .filter(|r| r.phase == PeerPhase::Delay)
            .count()
    }

    /// Once at least `quorum` distinct peers have reported a delay, returns
    /// the integer-division average of their proposals; otherwise `None`.
    pub fn average_delay(&self, quorum: usize) -> Option<u8> {
        if quorum == 0 {
            return None;
        }
        let reports: Vec<u32> = self
            .peers
            .values()
            .filter(|r| r.phase == PeerPhase::Delay)
            .map(|r| r.reported_delay as u32)
            .collect();
        if reports.len() < quorum {
            return None;
        }
        let sum: u32 = reports.iter().sum();
        Some((sum / reports.len() as u32) as u8)
    }

    /// Rebuilds the roster candidate list: `host_ep` (the host's own
    /// endpoint, as announced by the joiner that just triggered this
    /// rebuild) first, then every peer whose last `Join` is still within
    /// `ttl`, stopping once `players_needed` entries are collected.
    pub fn candidate_roster(&self, host_ep: Endpoint, ttl: Duration, now: Instant) -> Vec<Endpoint> {
        let mut roster = vec![host_ep];
        for (ep, record) in &self.peers {
            if roster.len() >= self.players_needed {
                break;
            }
            if record.phase == PeerPhase::Join && now.duration_since(record.last_seen) < ttl {
                roster.push(*ep);
            }
        }
        roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn candidate_roster_puts_host_first_and_stops_at_quorum() {
        let mut bk = CreateBookkeeping::new(3);
        let now = Instant::now();
        bk.record_join(ep(2), now);
        bk.record_join(ep(3), now);
        bk.record_join(ep(4), now);

        let roster = bk.candidate_roster(ep(1), Duration::from_millis(1000), now);
        assert_eq!(roster.len(), 3);
        assert_eq!(roster[0], ep(1));
    }

    #[test]
    fn candidate_roster_excludes_stale_joins() {
        let mut bk = CreateBookkeeping::new(2);
        let t0 = Instant::now();
        bk.record_join(ep(2), t0);

        let later = t0 + Duration::from_millis(1500);
        let roster = bk.candidate_roster(ep(1), Duration::from_millis(1000), later);
        assert_eq!(roster, vec![ep(1)]);
    }

    #[test]
    fn delay_reporters_counts_only_delay_phase() {
        let mut bk = CreateBookkeeping::new(3);
        let now = Instant::now();
        bk.record_join(ep(2), now);
        bk.record_delay(ep(3), 4, now);
        assert_eq!(bk.delay_reporters(), 1);
    }

    #[test]
    fn repeated_reports_from_the_same_peer_do_not_inflate_the_reporter_count() {
        let mut bk = CreateBookkeeping::new(3);
        let now = Instant::now();
        bk.record_delay(ep(2), 3, now);
        bk.record_delay(ep(2), 3, now + Duration::from_millis(50));
        bk.record_delay(ep(2), 3, now + Duration::from_millis(100));
        assert_eq!(bk.delay_reporters(), 1);
        assert_eq!(bk.average_delay(2), None);
    }

    #[test]
    fn average_delay_waits_for_distinct_reporters_then_averages() {
        let mut bk = CreateBookkeeping::new(3);
        let now = Instant::now();
        bk.record_delay(ep(2), 3, now);
        assert_eq!(bk.average_delay(2), None, "only one distinct peer so far");
        bk.record_delay(ep(2), 3, now + Duration::from_millis(50)); // retransmission
        assert_eq!(bk.average_delay(2), None, "retransmission must not count twice");
        bk.record_delay(ep(3), 5, now);
        assert_eq!(bk.average_delay(2), Some(4)); // (3+5)/2 == 4
    }
}
