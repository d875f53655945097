//! Per-instance state: descriptors, the lifecycle state enum, and the
//! status snapshot the control surface reads.
//!
//! The state machine itself lives in [`machine`]; the single-threaded
//! actor loop that owns it lives in [`actor`].

pub mod actor;
pub mod machine;
pub mod timers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum characters kept from an error before it is attached to an
/// instance as its last-error excerpt.
const LAST_ERROR_MAX_LEN: usize = 500;

/// Per-instance webhook sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    /// URL events are POSTed to.
    pub url: String,
    /// Shared secret for the HMAC signature header.
    pub secret: String,
}

/// The persisted part of an instance: everything needed to restore it.
///
/// The full list of descriptors is written to `instances.json` and read
/// back at startup by the restore scheduler. External maintenance tooling
/// reads the same file to decide which session directories are orphaned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Unique, stable instance identifier.
    pub id: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Webhook sink, if configured for this tenant.
    pub webhook: Option<WebhookTarget>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of an instance.
///
/// `Error` is terminal pending explicit operator action; `Disconnected`
/// is recoverable. Transitions occur only along the edges applied by
/// [`machine::StateMachine`], never arbitrarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Registered but never launched.
    Created,
    /// Automation engine launching / connecting to the remote service.
    Connecting,
    /// Waiting for the operator to scan a login QR.
    NeedsQr,
    /// Authenticated; history sync in progress.
    Syncing,
    /// Fully ready; queue drain enabled.
    Active,
    /// Connection lost; recoverable after cooldown.
    Disconnected,
    /// Terminal failure; requires operator intervention.
    Error,
}

impl InstanceState {
    /// Whether this state is terminal (no automatic recovery).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error)
    }

    /// Whether the outbound queue may drain in this state.
    pub fn can_drain(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether inbound events are buffered rather than processed
    /// immediately in this state.
    pub fn is_reduced_capacity(self) -> bool {
        matches!(self, Self::Syncing | Self::NeedsQr)
    }

    /// Stable label used in logs and webhook payloads.
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::NeedsQr => "needs_qr",
            Self::Syncing => "syncing",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// One QR login attempt, time-boxed and retryable.
///
/// Destroyed on successful authentication or once recovery attempts are
/// exhausted.
#[derive(Debug, Clone)]
pub struct QrCycle {
    /// Recovery attempt number, zero for the initial cycle.
    pub attempt: u32,
    /// When this cycle started.
    pub started_at: tokio::time::Instant,
    /// When a QR code was last observed.
    pub last_qr_seen_at: tokio::time::Instant,
}

/// Structured last-error value attached to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    /// Bounded diagnostic excerpt.
    pub message: String,
    /// When the error was recorded.
    pub at: DateTime<Utc>,
}

impl LastError {
    /// Record an error now, truncating the message to a bounded excerpt.
    pub fn now(message: impl AsRef<str>) -> Self {
        let message = message.as_ref();
        let truncated = message
            .char_indices()
            .nth(LAST_ERROR_MAX_LEN)
            .map_or(message, |(idx, _)| &message[..idx]);
        Self {
            message: truncated.to_owned(),
            at: Utc::now(),
        }
    }
}

/// Point-in-time status snapshot of one instance.
///
/// Instance state and last-error are the only externally observable
/// failure signals from the core; the control surface renders them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Instance identifier.
    pub id: String,
    /// Display name.
    pub display_name: String,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Outbound queue depth.
    pub queue_len: usize,
    /// Inbound buffer depth.
    pub inbound_len: usize,
    /// Restarts counted in the current window.
    pub restart_count: u32,
    /// QR recovery attempt number, if a QR cycle is live.
    pub qr_attempt: Option<u32>,
    /// Whether the current QR is stale (no refresh past the threshold).
    pub qr_stale: bool,
    /// Whether the zombie check has flagged this instance (diagnostic).
    pub zombie_flagged: bool,
    /// Last recorded error, if any.
    pub last_error: Option<LastError>,
    /// Seconds since the last observed activity.
    pub idle_secs: u64,
}
