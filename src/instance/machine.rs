//! Per-instance lifecycle state machine.
//!
//! Pure transition logic: every input (engine event, watchdog firing,
//! launch command) maps to a new state plus a list of [`Effect`]s for the
//! actor to carry out. The machine never touches the engine, timers or
//! queue itself, which keeps every transition rule synchronously testable.
//!
//! Readiness is deliberately a merge of two signals — the `ready` event
//! or a positive identity poll, whichever lands first — because the
//! engine's `ready` event is known to go missing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::timers::TimerKind;
use super::{InstanceState, LastError, QrCycle};
use crate::config::HubConfig;
use crate::engine::is_restriction_signal;

/// A side effect requested by a transition, interpreted by the actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Launch a fresh engine session for this instance.
    LaunchSession,
    /// Destroy the current engine session, if any.
    DestroySession,
    /// Arm (or re-arm) a timer.
    Arm(TimerKind, Duration),
    /// Cancel a timer.
    Cancel(TimerKind),
    /// Stop draining the outbound queue.
    PauseDrain,
    /// Resume draining the outbound queue.
    ResumeDrain,
    /// Compute the next restart delay from the backoff controller and
    /// arm the reconnect timer with it.
    ScheduleRestart,
    /// Arm the reconnect timer with the QR recovery backoff for `attempt`.
    ScheduleQrRecovery {
        /// Recovery attempt number (1-based).
        attempt: u32,
    },
    /// Emit a webhook notification.
    Notify {
        /// Event name in the webhook envelope.
        event: &'static str,
        /// Event payload.
        data: serde_json::Value,
    },
}

/// The authoritative state machine for one instance.
#[derive(Debug)]
pub struct StateMachine {
    id: String,
    cfg: Arc<HubConfig>,
    state: InstanceState,
    qr: Option<QrCycle>,
    /// QR recovery launches performed so far; survives relaunches.
    qr_recovery_attempts: u32,
    /// Connecting-watchdog restarts performed so far.
    connecting_restarts: u32,
    last_activity: Instant,
    zombie_flagged: bool,
    last_error: Option<LastError>,
}

impl StateMachine {
    /// Create a machine in `Created` for the given instance id.
    pub fn new(id: String, cfg: Arc<HubConfig>, now: Instant) -> Self {
        Self {
            id,
            cfg,
            state: InstanceState::Created,
            qr: None,
            qr_recovery_attempts: 0,
            connecting_restarts: 0,
            last_activity: now,
            zombie_flagged: false,
            last_error: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Live QR cycle, if any.
    pub fn qr(&self) -> Option<&QrCycle> {
        self.qr.as_ref()
    }

    /// Whether the current QR has gone stale (no refresh past threshold).
    pub fn qr_stale(&self, now: Instant) -> bool {
        self.qr.as_ref().is_some_and(|qr| {
            now.saturating_duration_since(qr.last_qr_seen_at)
                > Duration::from_secs(self.cfg.qr.stale_after_secs)
        })
    }

    /// Whether the zombie check has flagged this instance.
    pub fn zombie_flagged(&self) -> bool {
        self.zombie_flagged
    }

    /// Last recorded error, if any.
    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Seconds since the last observed activity.
    pub fn idle_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.last_activity).as_secs()
    }

    /// Record an error excerpt on the instance.
    pub fn record_error(&mut self, message: impl AsRef<str>) {
        self.last_error = Some(LastError::now(message));
    }

    /// Record observed activity; clears the zombie flag.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.zombie_flagged = false;
    }

    // ── Commands ────────────────────────────────────────────────

    /// Begin (or re-begin) connecting. Valid from `Created` and
    /// `Disconnected`; a no-op in every other state.
    pub fn on_launch(&mut self, _now: Instant) -> Vec<Effect> {
        match self.state {
            InstanceState::Created | InstanceState::Disconnected => {}
            other => {
                debug!(instance = %self.id, state = other.label(), "ignoring launch");
                return Vec::new();
            }
        }

        self.enter(InstanceState::Connecting);
        // LaunchSession stays last: a failed launch appends its own
        // follow-up effects, which must land after the watchdog is armed
        // and the transition announced.
        vec![
            Effect::Cancel(TimerKind::Reconnect),
            Effect::Cancel(TimerKind::ReadyWatchdog),
            Effect::Cancel(TimerKind::ReadyPoll),
            Effect::Cancel(TimerKind::QrTtl),
            Effect::Cancel(TimerKind::MessagePoll),
            Effect::PauseDrain,
            Effect::Arm(
                TimerKind::ConnectingWatchdog,
                Duration::from_secs(self.cfg.watchdog.connecting_timeout_secs),
            ),
            self.state_notification(None),
            Effect::LaunchSession,
        ]
    }

    /// A launch attempt failed before producing a session handle.
    ///
    /// Transient by taxonomy: recorded and handed to the restart
    /// controller, never fatal on its own.
    pub fn on_launch_failed(&mut self, error: &str, _now: Instant) -> Vec<Effect> {
        self.record_error(error);
        self.enter(InstanceState::Disconnected);
        vec![
            Effect::Cancel(TimerKind::ConnectingWatchdog),
            Effect::PauseDrain,
            Effect::ScheduleRestart,
            self.state_notification(Some("launch_failed")),
        ]
    }

    /// Force the instance into the terminal `Error` state.
    pub fn force_error(&mut self, reason: &str) -> Vec<Effect> {
        self.record_error(reason);
        self.enter(InstanceState::Error);
        let mut effects = cancel_everything();
        effects.push(Effect::PauseDrain);
        effects.push(Effect::DestroySession);
        effects.push(self.state_notification(Some(reason)));
        effects
    }

    // ── Engine events ───────────────────────────────────────────

    /// A QR code was issued or refreshed.
    pub fn on_qr(&mut self, now: Instant) -> Vec<Effect> {
        match self.state {
            InstanceState::Connecting => {
                self.enter(InstanceState::NeedsQr);
                self.qr = Some(QrCycle {
                    attempt: self.qr_recovery_attempts,
                    started_at: now,
                    last_qr_seen_at: now,
                });
                vec![
                    Effect::Arm(
                        TimerKind::QrTtl,
                        Duration::from_secs(self.cfg.qr.ttl_secs),
                    ),
                    self.state_notification(None),
                ]
            }
            InstanceState::NeedsQr => {
                // Refresh only: the QR TTL measures how long we have been
                // waiting for a scan, not how fresh the current code is.
                if let Some(qr) = self.qr.as_mut() {
                    qr.last_qr_seen_at = now;
                }
                Vec::new()
            }
            other => {
                debug!(instance = %self.id, state = other.label(), "ignoring qr event");
                Vec::new()
            }
        }
    }

    /// The session authenticated; begin syncing and arm both ready signals.
    pub fn on_authenticated(&mut self, now: Instant) -> Vec<Effect> {
        match self.state {
            InstanceState::Connecting | InstanceState::NeedsQr => {}
            other => {
                debug!(instance = %self.id, state = other.label(), "ignoring authenticated event");
                return Vec::new();
            }
        }

        self.qr = None;
        self.qr_recovery_attempts = 0;
        self.connecting_restarts = 0;
        self.record_activity(now);
        self.enter(InstanceState::Syncing);
        vec![
            Effect::Cancel(TimerKind::ConnectingWatchdog),
            Effect::Cancel(TimerKind::QrTtl),
            Effect::Arm(
                TimerKind::ReadyWatchdog,
                Duration::from_secs(self.cfg.watchdog.ready_timeout_secs),
            ),
            Effect::Arm(
                TimerKind::ReadyPoll,
                Duration::from_secs(self.cfg.watchdog.ready_poll_interval_secs),
            ),
            self.state_notification(None),
        ]
    }

    /// The session is ready — via the `ready` event or a positive
    /// identity poll, whichever arrived first.
    pub fn on_ready(&mut self, now: Instant, source: ReadySource) -> Vec<Effect> {
        if self.state != InstanceState::Syncing {
            debug!(instance = %self.id, state = self.state.label(), "ignoring ready signal");
            return Vec::new();
        }

        self.record_activity(now);
        self.enter(InstanceState::Active);
        let mut effects = vec![
            Effect::Cancel(TimerKind::ReadyWatchdog),
            Effect::Cancel(TimerKind::ReadyPoll),
            Effect::ResumeDrain,
        ];
        if self.cfg.watchdog.message_poll_enabled {
            effects.push(Effect::Arm(
                TimerKind::MessagePoll,
                Duration::from_secs(self.cfg.watchdog.message_poll_interval_secs),
            ));
        }
        effects.push(Effect::Notify {
            event: "state_changed",
            data: json!({
                "state": InstanceState::Active.label(),
                "ready_source": source.label(),
            }),
        });
        effects
    }

    /// The session disconnected, or authentication failed.
    ///
    /// Enters the disconnect cooldown: all sends and reconnect attempts
    /// pause for at least the minimum cooldown regardless of cause. A
    /// reason carrying a restriction/ban marker extends the cooldown to
    /// the much longer restricted duration instead.
    pub fn on_disconnected(&mut self, reason: Option<&str>, _now: Instant) -> Vec<Effect> {
        if self.state.is_terminal() || self.state == InstanceState::Disconnected {
            return Vec::new();
        }

        let restricted = is_restriction_signal(reason);
        let cooldown = if restricted {
            warn!(
                instance = %self.id,
                reason = reason.unwrap_or("unknown"),
                "remote restriction signal detected, applying extended cooldown"
            );
            Duration::from_secs(self.cfg.disconnect.restricted_cooldown_secs)
        } else {
            Duration::from_secs(self.cfg.disconnect.cooldown_secs)
        };

        if let Some(reason) = reason {
            self.record_error(format!("disconnected: {reason}"));
        }

        self.qr = None;
        self.enter(InstanceState::Disconnected);
        let mut effects = cancel_everything();
        effects.push(Effect::PauseDrain);
        effects.push(Effect::DestroySession);
        effects.push(Effect::Arm(TimerKind::Reconnect, cooldown));
        effects.push(Effect::Notify {
            event: "state_changed",
            data: json!({
                "state": InstanceState::Disconnected.label(),
                "reason": reason,
                "restricted": restricted,
            }),
        });
        effects
    }

    // ── Watchdogs ───────────────────────────────────────────────

    /// The connecting-watchdog fired: stuck in connecting/QR too long.
    pub fn on_connecting_watchdog(&mut self, _now: Instant) -> Vec<Effect> {
        if !matches!(
            self.state,
            InstanceState::Connecting | InstanceState::NeedsQr
        ) {
            return Vec::new();
        }

        self.connecting_restarts = self.connecting_restarts.saturating_add(1);
        if self.connecting_restarts > self.cfg.watchdog.connecting_max_restarts {
            warn!(
                instance = %self.id,
                restarts = self.connecting_restarts,
                "connecting watchdog restart cap exceeded"
            );
            return self.force_error("connecting watchdog restart cap exceeded");
        }

        self.record_error("stuck connecting, forcing restart");
        self.qr = None;
        self.enter(InstanceState::Disconnected);
        let mut effects = cancel_everything();
        effects.push(Effect::PauseDrain);
        effects.push(Effect::DestroySession);
        effects.push(Effect::ScheduleRestart);
        effects.push(self.state_notification(Some("connecting_timeout")));
        effects
    }

    /// The QR TTL elapsed with no scan: trigger one recovery re-launch,
    /// capped at the configured number of attempts. Exhausting the cap is
    /// terminal: an unattended QR loop burns a browser session per attempt
    /// with nobody there to scan.
    pub fn on_qr_ttl(&mut self, _now: Instant) -> Vec<Effect> {
        if self.state != InstanceState::NeedsQr {
            return Vec::new();
        }

        self.qr_recovery_attempts = self.qr_recovery_attempts.saturating_add(1);
        if self.qr_recovery_attempts > self.cfg.qr.max_recovery_attempts {
            return self.force_error("qr recovery attempts exhausted");
        }

        let attempt = self.qr_recovery_attempts;
        self.qr = None;
        self.enter(InstanceState::Disconnected);
        let mut effects = cancel_everything();
        effects.push(Effect::PauseDrain);
        effects.push(Effect::DestroySession);
        effects.push(Effect::ScheduleQrRecovery { attempt });
        effects.push(self.state_notification(Some("qr_expired")));
        effects
    }

    /// The ready-watchdog fired: syncing produced neither signal in time.
    ///
    /// Pauses the instance for the configured cooldown before the next
    /// launch attempt is allowed.
    pub fn on_ready_watchdog(&mut self, _now: Instant) -> Vec<Effect> {
        if self.state != InstanceState::Syncing {
            return Vec::new();
        }

        self.record_error("ready timeout while syncing");
        self.enter(InstanceState::Disconnected);
        let mut effects = cancel_everything();
        effects.push(Effect::PauseDrain);
        effects.push(Effect::DestroySession);
        effects.push(Effect::Arm(
            TimerKind::Reconnect,
            Duration::from_secs(self.cfg.watchdog.ready_retry_cooldown_secs),
        ));
        effects.push(self.state_notification(Some("ready_timeout")));
        effects
    }

    /// The reconnect timer fired: the cooldown or backoff delay elapsed.
    pub fn on_reconnect_due(&mut self, now: Instant) -> Vec<Effect> {
        if self.state != InstanceState::Disconnected {
            return Vec::new();
        }
        self.on_launch(now)
    }

    /// Periodic zombie check while active: flag, never restart.
    pub fn on_health_check(&mut self, now: Instant) {
        if self.state == InstanceState::Active
            && self.idle_secs(now) > self.cfg.health.zombie_after_secs
            && !self.zombie_flagged
        {
            warn!(
                instance = %self.id,
                idle_secs = self.idle_secs(now),
                "no activity past zombie threshold, flagging (diagnostic only)"
            );
            self.zombie_flagged = true;
        }
    }

    // ── Internals ───────────────────────────────────────────────

    fn enter(&mut self, next: InstanceState) {
        debug!(
            instance = %self.id,
            from = self.state.label(),
            to = next.label(),
            "state transition"
        );
        self.state = next;
    }

    fn state_notification(&self, reason: Option<&str>) -> Effect {
        Effect::Notify {
            event: "state_changed",
            data: json!({
                "state": self.state.label(),
                "reason": reason,
            }),
        }
    }
}

/// Which of the two merged readiness signals resolved first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    /// The engine's `ready` event.
    Event,
    /// The periodic identity poll.
    Poll,
}

impl ReadySource {
    /// Stable label for logs and webhook payloads.
    pub fn label(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Poll => "poll",
        }
    }
}

/// Cancel every watchdog, poll and pending reconnect.
fn cancel_everything() -> Vec<Effect> {
    vec![
        Effect::Cancel(TimerKind::ConnectingWatchdog),
        Effect::Cancel(TimerKind::ReadyWatchdog),
        Effect::Cancel(TimerKind::ReadyPoll),
        Effect::Cancel(TimerKind::QrTtl),
        Effect::Cancel(TimerKind::MessagePoll),
        Effect::Cancel(TimerKind::Reconnect),
    ]
}
