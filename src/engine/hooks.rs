//! Pluggable hooks around send operations.
//!
//! Humanization heuristics (typing delay, selective read receipts) live
//! outside the core; the orchestrator only provides the seam. The default
//! implementation does nothing.

use async_trait::async_trait;

use super::{EngineError, SessionEngine, SessionHandle};

/// Hooks invoked around every outbound send.
///
/// Implementations get the engine so they can drive cosmetic commands
/// (typing indicators, mark-seen). Hook failures are logged by the caller
/// and never fail the send itself.
#[async_trait]
pub trait SendHooks: Send + Sync {
    /// Called immediately before a send is dispatched.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and otherwise ignored.
    async fn before_send(
        &self,
        _engine: &dyn SessionEngine,
        _handle: &SessionHandle,
        _chat_id: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called after a send was dispatched successfully.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and otherwise ignored.
    async fn after_send(
        &self,
        _engine: &dyn SessionEngine,
        _handle: &SessionHandle,
        _chat_id: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// The default hook set: no humanization at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

#[async_trait]
impl SendHooks for NoHooks {}
