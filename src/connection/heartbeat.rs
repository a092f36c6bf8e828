//! Heartbeat monitor for silently-dead connections.
//!
//! Intermediary proxies can keep a socket open long after the server is
//! gone, so socket errors alone are not enough. Each tick, if nothing was
//! heard from the server since the previous tick, a missed count goes up
//! and a `PING` probe is sent; at the configured ceiling the connection is
//! declared stale and torn down for reconnect. Any inbound traffic resets
//! the count. The connection creates a fresh monitor on every dial so
//! stale counts never carry across reconnects.

use std::time::Duration;

/// What the connection should do after a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    /// Traffic was observed since the last tick; nothing to do.
    Healthy,
    /// Silence since the last tick; send a `PING` probe.
    Probe,
    /// Too many silent intervals; force disconnect and reconnect.
    Stale,
}

/// Missed-probe tracker, advanced by the connection's interval timer.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Duration,
    max_missed: u32,
    missed: u32,
    traffic: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed,
            missed: 0,
            traffic: false,
        }
    }

    /// Interval the connection should schedule ticks at.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record inbound traffic (any bytes, including `PONG`).
    pub fn note_traffic(&mut self) {
        self.traffic = true;
        self.missed = 0;
    }

    /// Advance one interval and decide what to do.
    pub fn tick(&mut self) -> HeartbeatAction {
        if self.traffic {
            self.traffic = false;
            self.missed = 0;
            return HeartbeatAction::Healthy;
        }
        self.missed += 1;
        if self.missed >= self.max_missed {
            HeartbeatAction::Stale
        } else {
            HeartbeatAction::Probe
        }
    }
}
