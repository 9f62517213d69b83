//! Ping/pong liveness detection above a managed socket.
//!
//! The monitor itself is deadline bookkeeping: the owning socket's event
//! loop sends a ping every [`MonitorOptions::ping_interval`] and feeds
//! observed pongs back in; when no pong arrives within
//! [`MonitorOptions::max_ping_delay`] of the last one (or of startup), the
//! link is declared dead and closed as if the peer had vanished.
//!
//! Pings and pongs travel as marker messages inside the regular messaging
//! framing, so the monitor only works on messaging-mode sockets. Messaging
//! sockets always answer pings, which lets a monitor run one-sided.

use std::time::{Duration, Instant};

/// Marker payload for a liveness probe
pub(crate) const PING_MARKER: &[u8] = b"\x00msgsock:ping";
/// Marker payload answering a probe
pub(crate) const PONG_MARKER: &[u8] = b"\x00msgsock:pong";

/// Connection monitor configuration
#[derive(Clone, Copy, Debug)]
pub struct MonitorOptions {
    /// Interval between outgoing pings
    pub ping_interval: Duration,
    /// Longest tolerated silence since the last observed pong
    pub max_ping_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            max_ping_delay: Duration::from_secs(30),
        }
    }
}

/// Deadline state for one monitored connection.
#[derive(Debug)]
pub struct ConnectionMonitor {
    options: MonitorOptions,
    started: Instant,
    last_pong: Option<Instant>,
}

impl ConnectionMonitor {
    /// Start tracking a freshly connected link.
    pub fn new(options: MonitorOptions) -> Self {
        Self {
            options,
            started: Instant::now(),
            last_pong: None,
        }
    }

    /// Interval at which the owning loop should send pings.
    pub fn ping_interval(&self) -> Duration {
        self.options.ping_interval
    }

    /// Note a pong from the peer, resetting the deadline.
    pub fn record_pong(&mut self) {
        self.last_pong = Some(Instant::now());
    }

    /// True once the silence since the last pong (or startup) exceeds the
    /// configured maximum.
    pub fn is_dead(&self, now: Instant) -> bool {
        let anchor = self.last_pong.unwrap_or(self.started);
        now.duration_since(anchor) > self.options.max_ping_delay
    }
}
