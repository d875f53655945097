//! Restart/backoff controller.
//!
//! Every forced restart increments a counter inside a sliding window.
//! The actual delay follows the configured escalating sequence, indexed
//! by a backoff position that advances per restart and resets once the
//! window elapses cleanly. Exceeding the window's restart cap delays the
//! next attempt until the window resets and layers the extra multi-hour
//! pause on top, so a flapping instance cannot consume restart capacity
//! indefinitely.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RestartConfig;

/// Decision for one forced restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    /// How long to wait before the next launch attempt.
    pub delay: Duration,
    /// Whether the window cap was exceeded and the extra pause applied.
    pub window_exhausted: bool,
}

/// Per-instance restart bookkeeping.
#[derive(Debug)]
pub struct RestartController {
    cfg: RestartConfig,
    count: u32,
    window_started_at: Option<Instant>,
    backoff_index: usize,
}

impl RestartController {
    /// Create a controller with no restarts recorded.
    pub fn new(cfg: RestartConfig) -> Self {
        Self {
            cfg,
            count: 0,
            window_started_at: None,
            backoff_index: 0,
        }
    }

    /// Record a forced restart and decide its delay.
    pub fn next_delay(&mut self, now: Instant) -> RestartDecision {
        self.maybe_reset(now);

        let window_start = *self.window_started_at.get_or_insert(now);
        self.count = self.count.saturating_add(1);

        if self.count > self.cfg.max_per_window {
            // Delay until the window resets, plus the configured extra
            // pause on top.
            let elapsed = now.saturating_duration_since(window_start);
            let remaining = self.window().saturating_sub(elapsed);
            let delay =
                remaining.saturating_add(Duration::from_secs(
                    self.cfg.extra_pause_hours.saturating_mul(3600),
                ));
            return RestartDecision {
                delay,
                window_exhausted: true,
            };
        }

        let delay = escalating_delay(&self.cfg.backoff_secs, self.backoff_index);
        self.backoff_index = self.backoff_index.saturating_add(1);
        RestartDecision {
            delay,
            window_exhausted: false,
        }
    }

    /// Restarts counted in the current window; zero once the window has
    /// elapsed with no intervening restart.
    pub fn restart_count(&self, now: Instant) -> u32 {
        match self.window_started_at {
            Some(start) if now.saturating_duration_since(start) < self.window() => self.count,
            _ => 0,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.cfg.window_minutes.saturating_mul(60))
    }

    fn maybe_reset(&mut self, now: Instant) {
        if let Some(start) = self.window_started_at {
            if now.saturating_duration_since(start) >= self.window() {
                self.count = 0;
                self.backoff_index = 0;
                self.window_started_at = None;
            }
        }
    }
}

/// Delay for `index` within an escalating sequence, clamping to the last
/// entry. An empty sequence yields zero.
pub fn escalating_delay(seq_secs: &[u64], index: usize) -> Duration {
    let secs = match seq_secs.get(index) {
        Some(s) => *s,
        None => seq_secs.last().copied().unwrap_or(0),
    };
    Duration::from_secs(secs)
}

/// Add up to 10% random jitter so simultaneous restarts spread out.
pub fn with_jitter(delay: Duration) -> Duration {
    use rand::Rng;

    let max_extra_ms = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if max_extra_ms == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=max_extra_ms);
    delay.saturating_add(Duration::from_millis(extra))
}
