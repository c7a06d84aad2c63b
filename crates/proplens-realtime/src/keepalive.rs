//! Keepalive watchdog.
//!
//! Armed on `connection_ack` with the negotiated interval. Checked every
//! `max(interval / 4, min_check)`; expires once no `ka` has been seen for
//! longer than the full interval, and fires at most once per connection.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks keepalive frames for one connection.
#[derive(Debug)]
pub struct KeepaliveWatchdog {
    interval: Duration,
    check_period: Duration,
    last_ka: Instant,
    fired: bool,
}

impl KeepaliveWatchdog {
    /// Arm the watchdog at `now`.
    pub fn new(interval: Duration, min_check: Duration, now: Instant) -> Self {
        Self {
            interval,
            check_period: (interval / 4).max(min_check),
            last_ka: now,
            fired: false,
        }
    }

    /// Negotiated interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How often [`fire`](Self::fire) should be polled.
    pub fn check_period(&self) -> Duration {
        self.check_period
    }

    /// Record a `ka` frame.
    pub fn observe_ka(&mut self, now: Instant) {
        self.last_ka = now;
    }

    /// Whether the gap since the last `ka` exceeds the interval.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ka) > self.interval
    }

    /// `true` exactly once, on the first check that finds the watchdog
    /// expired.
    pub fn fire(&mut self, now: Instant) -> bool {
        if self.fired || !self.is_expired(now) {
            return false;
        }
        self.fired = true;
        true
    }
}
