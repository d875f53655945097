//! Automation engine contract: the narrow capability interface the
//! orchestrator consumes.
//!
//! The browser automation engine is a third-party surface, so the core
//! only sees [`SessionEngine`]: initialize/destroy, chat lookup, sends,
//! and two poll fallbacks for the signals the engine is known to drop
//! (`ready`, `message`). Tests swap in a deterministic fake.

pub mod bridge;
pub mod hooks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::instance::InstanceDescriptor;

/// Errors from the automation engine boundary.
///
/// Every engine call is caught at this boundary and folded into the
/// instance's last-error value; none of these may escape an instance actor.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation exceeded its hard timeout.
    #[error("engine operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Session launch failed before the engine produced a handle.
    #[error("session launch failed: {0}")]
    LaunchFailed(String),

    /// The session is not connected to the remote service.
    #[error("session not connected")]
    NotConnected,

    /// The requested chat does not exist or could not be resolved.
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    /// The engine refused the send.
    #[error("send rejected: {0}")]
    SendRejected(String),

    /// HTTP transport failure talking to the engine bridge.
    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Any other engine failure.
    #[error("engine failure: {0}")]
    Failure(String),
}

/// Opaque handle to one live automation-engine session.
///
/// Exclusively owned by its instance: at most one live handle per
/// instance exists at any time, and the handle is consumed on destroy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Wrap an engine-assigned session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The engine-assigned session identifier.
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// A lifecycle or message event emitted by the automation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A login QR code was (re)issued.
    Qr {
        /// Encoded QR payload for the operator to scan.
        code: String,
    },
    /// The session authenticated; history sync begins.
    Authenticated,
    /// The engine reports the session fully ready. Known to be unreliable;
    /// the orchestrator also accepts a positive identity poll.
    Ready,
    /// Engine-internal state label changed (diagnostic only).
    StateChange {
        /// Engine-reported state label.
        state: String,
    },
    /// The session disconnected.
    Disconnected {
        /// Engine-reported reason, if any.
        reason: Option<String>,
    },
    /// Authentication was rejected by the remote service.
    AuthFailure {
        /// Engine-reported reason.
        reason: String,
    },
    /// An inbound message arrived.
    Message(InboundMessage),
}

/// An inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Chat the message belongs to.
    pub chat_id: String,
    /// Engine-assigned message identifier, if any.
    pub message_id: Option<String>,
    /// Message text content.
    pub body: String,
    /// Whether the message was sent by this instance's own account.
    pub from_me: bool,
    /// Remote timestamp, if available.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Receipt for a dispatched send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Engine-assigned message identifier.
    pub message_id: String,
    /// Chat the message was sent to.
    pub chat_id: String,
}

/// Resolved chat metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatInfo {
    /// Canonical chat identifier.
    pub chat_id: String,
    /// Display name, if known.
    pub name: Option<String>,
    /// Whether this is a group chat.
    pub is_group: bool,
}

/// The capability interface over the browser automation engine.
///
/// One implementation talks to the production sidecar ([`bridge`]); tests
/// drive the orchestrator with a scripted fake.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Launch a session for the given instance.
    ///
    /// Lifecycle events for the session are delivered on `events` until
    /// the session is destroyed or the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be launched.
    async fn initialize(
        &self,
        descriptor: &InstanceDescriptor,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<SessionHandle, EngineError>;

    /// Tear down a session, releasing its browser resources.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails; callers treat the handle as
    /// dead either way.
    async fn destroy(&self, handle: SessionHandle) -> Result<(), EngineError>;

    /// Resolve a chat by its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChatNotFound`] if the chat cannot be resolved.
    async fn get_chat_by_id(
        &self,
        handle: &SessionHandle,
        chat_id: &str,
    ) -> Result<ChatInfo, EngineError>;

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses or fails the send.
    async fn send_message(
        &self,
        handle: &SessionHandle,
        chat_id: &str,
        body: &str,
    ) -> Result<SendReceipt, EngineError>;

    /// Send a poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses or fails the send.
    async fn send_poll(
        &self,
        handle: &SessionHandle,
        chat_id: &str,
        question: &str,
        options: &[String],
    ) -> Result<SendReceipt, EngineError>;

    /// Show the typing indicator in a chat.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure; cosmetic, callers may ignore.
    async fn set_typing(&self, handle: &SessionHandle, chat_id: &str) -> Result<(), EngineError>;

    /// Clear the typing indicator in a chat.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure; cosmetic, callers may ignore.
    async fn clear_typing(&self, handle: &SessionHandle, chat_id: &str) -> Result<(), EngineError>;

    /// Mark a chat's messages as seen.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure.
    async fn mark_seen(&self, handle: &SessionHandle, chat_id: &str) -> Result<(), EngineError>;

    /// Poll the session's own identity.
    ///
    /// A `Some` result proves the session is ready even when the `ready`
    /// event never fired.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure.
    async fn session_identity(
        &self,
        handle: &SessionHandle,
    ) -> Result<Option<String>, EngineError>;

    /// Poll for unread messages.
    ///
    /// Fallback for the `message` event stream, which may silently stop.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure.
    async fn unread_messages(
        &self,
        handle: &SessionHandle,
    ) -> Result<Vec<InboundMessage>, EngineError>;
}

/// Markers in disconnect reasons that indicate the remote service has
/// throttled or banned the account, warranting the extended cooldown.
const RESTRICTION_MARKERS: [&str; 5] = ["ban", "restrict", "blocked", "403", "unpaired"];

/// Classify a disconnect reason as a remote restriction/ban signal.
///
/// Matching is substring-based and case-insensitive; an absent reason is
/// never a restriction.
pub fn is_restriction_signal(reason: Option<&str>) -> bool {
    let Some(reason) = reason else {
        return false;
    };
    let lower = reason.to_lowercase();
    RESTRICTION_MARKERS.iter().any(|m| lower.contains(m))
}
