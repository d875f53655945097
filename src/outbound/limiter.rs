//! Per-instance send rate limiter.
//!
//! Two fixed windows, per-minute and per-hour. A send that would exceed
//! either limit is deferred — the caller re-queues the item and retries
//! once the binding window rolls over — never dropped here.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateConfig;

/// One fixed counting window.
#[derive(Debug)]
struct Window {
    len: Duration,
    limit: u32,
    started_at: Instant,
    count: u32,
}

impl Window {
    fn new(len: Duration, limit: u32, now: Instant) -> Self {
        Self {
            len,
            limit,
            started_at: now,
            count: 0,
        }
    }

    /// Roll the window forward if it has elapsed.
    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started_at) >= self.len {
            self.started_at = now;
            self.count = 0;
        }
    }

    /// Whether one more send fits, without recording it.
    fn has_room(&self) -> bool {
        self.count < self.limit
    }

    /// Time until this window rolls over.
    fn until_reset(&self, now: Instant) -> Duration {
        self.len
            .saturating_sub(now.saturating_duration_since(self.started_at))
    }
}

/// Per-instance rate limiter enforcing sends-per-minute and sends-per-hour.
#[derive(Debug)]
pub struct RateLimiter {
    minute: Window,
    hour: Window,
}

impl RateLimiter {
    /// Create a limiter from configured limits.
    pub fn new(cfg: &RateConfig, now: Instant) -> Self {
        Self {
            minute: Window::new(Duration::from_secs(60), cfg.sends_per_minute, now),
            hour: Window::new(Duration::from_secs(3600), cfg.sends_per_hour, now),
        }
    }

    /// Try to admit one send.
    ///
    /// On success the send is counted against both windows. On refusal
    /// returns how long until the binding window has room again.
    ///
    /// # Errors
    ///
    /// Returns the defer duration when either window is exhausted.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.minute.roll(now);
        self.hour.roll(now);

        if !self.minute.has_room() {
            return Err(self.minute.until_reset(now));
        }
        if !self.hour.has_room() {
            return Err(self.hour.until_reset(now));
        }

        self.minute.count = self.minute.count.saturating_add(1);
        self.hour.count = self.hour.count.saturating_add(1);
        Ok(())
    }

    /// Sends counted in the current minute window.
    pub fn minute_count(&self) -> u32 {
        self.minute.count
    }

    /// Sends counted in the current hour window.
    pub fn hour_count(&self) -> u32 {
        self.hour.count
    }
}
