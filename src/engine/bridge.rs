//! HTTP client for the browser automation sidecar.
//!
//! The production [`SessionEngine`] implementation. All session commands
//! go through the sidecar's HTTP API; lifecycle events arrive via a
//! per-session long-polling task that reconnects with exponential backoff.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ChatInfo, EngineError, EngineEvent, InboundMessage, SendReceipt, SessionEngine, SessionHandle,
};
use crate::instance::InstanceDescriptor;

/// Default port the automation sidecar listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 3311;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Long-poll timeout for the event listener client (seconds).
const POLL_TIMEOUT_SECS: u64 = 60;

/// Maximum event-listener reconnect backoff (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Response envelope from the sidecar HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct InitData {
    handle: String,
}

#[derive(Deserialize)]
struct IdentityData {
    identity: Option<String>,
}

/// [`SessionEngine`] implementation backed by the HTTP sidecar.
///
/// Hard timeouts on individual operations are applied by the caller; the
/// client-level timeout here is only a transport backstop.
pub struct BridgeEngine {
    client: reqwest::Client,
    base_url: String,
    /// Event-listener tasks keyed by session handle id, aborted on destroy.
    listeners: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl BridgeEngine {
    /// Create a new client pointing at the given base URL.
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Create a client connecting to `http://127.0.0.1:{port}`.
    pub fn with_port(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{port}"))
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, handle: &SessionHandle, tail: &str) -> String {
        format!("{}/sessions/{}/{tail}", self.base_url, handle.id())
    }

    async fn post_command(
        &self,
        handle: &SessionHandle,
        tail: &str,
        body: serde_json::Value,
    ) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(self.session_url(handle, tail))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            warn!(%status, tail, "bridge command failed: {body_text}");
            return Err(EngineError::NotConnected);
        }
        Ok(())
    }

    fn track_listener(&self, handle_id: String, task: tokio::task::JoinHandle<()>) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = listeners.insert(handle_id, task) {
            old.abort();
        }
    }

    fn stop_listener(&self, handle_id: &str) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = listeners.remove(handle_id) {
            task.abort();
        }
    }
}

#[async_trait]
impl SessionEngine for BridgeEngine {
    async fn initialize(
        &self,
        descriptor: &InstanceDescriptor,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<SessionHandle, EngineError> {
        let url = format!("{}/sessions/{}/init", self.base_url, descriptor.id);
        let resp = self.client.post(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LaunchFailed(format!("{status}: {body_text}")));
        }
        let body: BridgeResponse<InitData> = resp.json().await?;
        let data = body.data.ok_or_else(|| {
            EngineError::LaunchFailed(body.error.unwrap_or_else(|| "no session handle".to_owned()))
        })?;

        let handle = SessionHandle::new(data.handle);
        let poll_url = self.session_url(&handle, "events/poll");
        let task = spawn_event_listener(poll_url, events);
        self.track_listener(handle.id().to_owned(), task);

        info!(instance = %descriptor.id, handle = handle.id(), "bridge session launched");
        Ok(handle)
    }

    async fn destroy(&self, handle: SessionHandle) -> Result<(), EngineError> {
        self.stop_listener(handle.id());
        self.post_command(&handle, "destroy", serde_json::json!({}))
            .await
    }

    async fn get_chat_by_id(
        &self,
        handle: &SessionHandle,
        chat_id: &str,
    ) -> Result<ChatInfo, EngineError> {
        let url = self.session_url(handle, &format!("chats/{chat_id}"));
        let resp = self.client.get(&url).send().await?;
        let body: BridgeResponse<ChatInfo> = resp.json().await?;
        body.data
            .ok_or_else(|| EngineError::ChatNotFound(chat_id.to_owned()))
    }

    async fn send_message(
        &self,
        handle: &SessionHandle,
        chat_id: &str,
        body: &str,
    ) -> Result<SendReceipt, EngineError> {
        let url = self.session_url(handle, "send");
        let payload = serde_json::json!({ "chat_id": chat_id, "body": body });
        let resp = self.client.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EngineError::SendRejected(format!("{status}: {body_text}")));
        }
        let envelope: BridgeResponse<SendReceipt> = resp.json().await?;
        envelope
            .data
            .ok_or_else(|| EngineError::SendRejected("no receipt from bridge".to_owned()))
    }

    async fn send_poll(
        &self,
        handle: &SessionHandle,
        chat_id: &str,
        question: &str,
        options: &[String],
    ) -> Result<SendReceipt, EngineError> {
        let url = self.session_url(handle, "send-poll");
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "question": question,
            "options": options,
        });
        let resp = self.client.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EngineError::SendRejected(format!("{status}: {body_text}")));
        }
        let envelope: BridgeResponse<SendReceipt> = resp.json().await?;
        envelope
            .data
            .ok_or_else(|| EngineError::SendRejected("no receipt from bridge".to_owned()))
    }

    async fn set_typing(&self, handle: &SessionHandle, chat_id: &str) -> Result<(), EngineError> {
        // Fire and forget — typing indicators are cosmetic.
        let url = self.session_url(handle, "typing");
        let _ = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "composing": true }))
            .send()
            .await;
        Ok(())
    }

    async fn clear_typing(&self, handle: &SessionHandle, chat_id: &str) -> Result<(), EngineError> {
        let url = self.session_url(handle, "typing");
        let _ = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "composing": false }))
            .send()
            .await;
        Ok(())
    }

    async fn mark_seen(&self, handle: &SessionHandle, chat_id: &str) -> Result<(), EngineError> {
        self.post_command(handle, "mark-seen", serde_json::json!({ "chat_id": chat_id }))
            .await
    }

    async fn session_identity(
        &self,
        handle: &SessionHandle,
    ) -> Result<Option<String>, EngineError> {
        let url = self.session_url(handle, "identity");
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: BridgeResponse<IdentityData> = resp.json().await?;
        Ok(body.data.and_then(|d| d.identity))
    }

    async fn unread_messages(
        &self,
        handle: &SessionHandle,
    ) -> Result<Vec<InboundMessage>, EngineError> {
        let url = self.session_url(handle, "unread");
        let resp = self.client.get(&url).send().await?;
        let body: BridgeResponse<Vec<InboundMessage>> = resp.json().await?;
        Ok(body.data.unwrap_or_default())
    }
}

/// Spawn an event listener that forwards sidecar events to the given channel.
///
/// Returns immediately. The listener runs as a background Tokio task and
/// reconnects automatically with exponential backoff. It exits when the
/// receiver is dropped or the task is aborted on destroy.
fn spawn_event_listener(
    poll_url: String,
    event_tx: mpsc::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff_ms: u64 = 1000;

        loop {
            debug!(url = %poll_url, "connecting to bridge event stream");

            match poll_events(&poll_url, &event_tx).await {
                Ok(()) => {
                    info!("bridge event stream closed normally");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "bridge event stream error, reconnecting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
    })
}

/// Poll the sidecar for events in a loop. Returns `Err` on non-timeout
/// network errors so the caller can reconnect with backoff.
async fn poll_events(
    poll_url: &str,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(POLL_TIMEOUT_SECS))
        .build()?;

    loop {
        match client.get(poll_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(events) = resp.json::<Vec<EngineEvent>>().await {
                    for event in events {
                        debug!(?event, "received bridge event");
                        if event_tx.send(event).await.is_err() {
                            // Receiver dropped — session was torn down.
                            return Ok(());
                        }
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) if e.is_timeout() => {
                // Normal: long-poll timeout expired, retry immediately.
                continue;
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }
}
