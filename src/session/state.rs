//! Session-wide state machine and roster bookkeeping.

use std::collections::HashMap;

use crate::endpoint::Endpoint;

/// One of the states a session can occupy.
///
/// `None` is both the initial and the post-shutdown terminal state.
/// `Ready` is the only operational state; `Deny` is terminal-on-failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Wait,
    Join,
    Ping,
    Info,
    Delay,
    Ready,
    Deny,
}

impl SessionState {
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Ready)
    }
}

/// The ordered list of session endpoints, authoritatively assigned by the
/// creator.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    /// All endpoints in side order, own endpoint included.
    pub endpoints: Vec<Endpoint>,
    /// Endpoint → side, derived from `endpoints`.
    pub sides: HashMap<Endpoint, usize>,
    /// This peer's own side index.
    pub own_side: usize,
}

impl Roster {
    pub fn build(endpoints: Vec<Endpoint>, own_side: usize) -> Self {
        let sides = endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| (*ep, i))
            .collect();
        Self {
            endpoints,
            sides,
            own_side,
        }
    }

    /// All endpoints except the local one, the session's broadcast list.
    pub fn remote_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.own_side)
            .map(|(_, ep)| *ep)
            .collect()
    }

    pub fn side_of(&self, ep: Endpoint) -> Option<usize> {
        self.sides.get(&ep).copied()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
