//! Player-side view of host liveness.
//!
//! Freshness comes from the host's own `lastUpdate` stamp. The first stamp
//! seen must be within the staleness window of the local clock; after that
//! a stamp that moved forward counts as fresh whatever the clock skew. The
//! host is considered gone when no fresh stamp has arrived for the window,
//! and the next fresh one reconnects automatically.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing observed yet
    Connecting,
    Connected,
    /// Host silent for longer than the staleness window
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Disconnected => write!(f, "Host Not Responding"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Liveness {
    window_ms: u64,
    started_at: u64,
    last_seen: Option<u64>,
    last_host_update: Option<u64>,
    state: LinkState,
}

impl Liveness {
    pub fn new(window: Duration, now_ms: u64) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            started_at: now_ms,
            last_seen: None,
            last_host_update: None,
            state: LinkState::Connecting,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Record a delivery stamped `host_ms` by the host. Returns the new
    /// state on a transition.
    pub fn observe(&mut self, host_ms: u64, now_ms: u64) -> Option<LinkState> {
        let fresh = match self.last_host_update {
            Some(previous) => host_ms > previous,
            None => now_ms.saturating_sub(host_ms) <= self.window_ms,
        };
        self.last_host_update = Some(self.last_host_update.map_or(host_ms, |p| p.max(host_ms)));

        if fresh {
            self.last_seen = Some(now_ms);
            self.transition(LinkState::Connected)
        } else if self.last_seen.is_none() {
            // Host was already silent before we arrived
            self.transition(LinkState::Disconnected)
        } else {
            self.check(now_ms)
        }
    }

    /// Re-evaluate staleness. Returns the new state on a transition.
    pub fn check(&mut self, now_ms: u64) -> Option<LinkState> {
        let reference = self.last_seen.unwrap_or(self.started_at);
        if now_ms.saturating_sub(reference) > self.window_ms {
            self.transition(LinkState::Disconnected)
        } else {
            None
        }
    }

    /// Start over, e.g. after switching to another game
    pub fn restart(&mut self, now_ms: u64) {
        self.started_at = now_ms;
        self.last_seen = None;
        self.last_host_update = None;
        self.state = LinkState::Connecting;
    }

    fn transition(&mut self, next: LinkState) -> Option<LinkState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
