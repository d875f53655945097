//! Centralized cancelable timers for one instance actor.
//!
//! Every watchdog, poll and cooldown is a named deadline in a single
//! [`TimerSet`]; the actor sleeps until the earliest one. Arming a timer
//! that is already armed replaces its deadline, so re-arming on a state
//! transition implicitly cancels the stale timer — a timer can never fire
//! against a since-changed instance.

use std::time::Duration;

use tokio::time::Instant;

/// Named timers owned by an instance actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires when the instance is stuck in connecting/QR too long.
    ConnectingWatchdog,
    /// Fires when syncing produced neither a ready event nor a poll hit.
    ReadyWatchdog,
    /// Periodic ready-poll fallback while syncing.
    ReadyPoll,
    /// Fires when needs-QR has persisted past the QR TTL.
    QrTtl,
    /// Periodic unread-message poll while active.
    MessagePoll,
    /// Periodic inbound buffer flush while entries are buffered.
    InboundFlush,
    /// Next launch attempt after a cooldown or backoff delay.
    Reconnect,
    /// Next permitted drain step (pacing / rate-limit deferral).
    Drain,
    /// Periodic zombie/health check.
    HealthCheck,
}

/// All timer kinds, in deadline-array order.
const ALL_KINDS: [TimerKind; 9] = [
    TimerKind::ConnectingWatchdog,
    TimerKind::ReadyWatchdog,
    TimerKind::ReadyPoll,
    TimerKind::QrTtl,
    TimerKind::MessagePoll,
    TimerKind::InboundFlush,
    TimerKind::Reconnect,
    TimerKind::Drain,
    TimerKind::HealthCheck,
];

impl TimerKind {
    fn index(self) -> usize {
        match self {
            Self::ConnectingWatchdog => 0,
            Self::ReadyWatchdog => 1,
            Self::ReadyPoll => 2,
            Self::QrTtl => 3,
            Self::MessagePoll => 4,
            Self::InboundFlush => 5,
            Self::Reconnect => 6,
            Self::Drain => 7,
            Self::HealthCheck => 8,
        }
    }
}

/// A set of named deadlines with single-owner arm/cancel semantics.
#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: [Option<Instant>; ALL_KINDS.len()],
}

impl TimerSet {
    /// Create an empty timer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer to fire after `delay`.
    pub fn arm(&mut self, kind: TimerKind, now: Instant, delay: Duration) {
        let at = now.checked_add(delay).unwrap_or(now);
        self.deadlines[kind.index()] = Some(at);
    }

    /// Cancel a timer if armed.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    /// Cancel every timer.
    pub fn cancel_all(&mut self) {
        self.deadlines = Default::default();
    }

    /// Whether a timer is currently armed.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Pop every timer whose deadline has passed.
    ///
    /// Fired timers are disarmed; periodic timers are re-armed by their
    /// handlers, not here.
    pub fn fire_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        for kind in ALL_KINDS {
            if let Some(at) = self.deadlines[kind.index()] {
                if at <= now {
                    self.deadlines[kind.index()] = None;
                    due.push(kind);
                }
            }
        }
        due
    }
}
