//! Signed webhook dispatcher.
//!
//! Every state transition and qualifying inbound event becomes a JSON
//! envelope POSTed to the instance's configured sink, signed with an
//! HMAC-SHA256 header. Dispatch is best-effort and fully decoupled from
//! the state machines: emission is a bounded-channel `try_send`, delivery
//! runs on its own task with a small bounded retry, and a slow or dead
//! sink can only ever cost dropped notifications, never a stalled
//! transition.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::instance::WebhookTarget;

/// Header carrying the hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Straylight-Signature";

type HmacSha256 = Hmac<Sha256>;

/// The JSON envelope delivered to webhook sinks.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// Event name (e.g. `state_changed`, `qr`, `message`).
    pub event: String,
    /// Instance the event belongs to.
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    /// Event payload.
    pub data: serde_json::Value,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

/// One queued delivery.
#[derive(Debug)]
struct WebhookJob {
    target: WebhookTarget,
    event: WebhookEvent,
}

/// Cloneable emission handle held by every instance actor.
#[derive(Clone)]
pub struct WebhookSender {
    tx: mpsc::Sender<WebhookJob>,
}

impl WebhookSender {
    /// Emit an event, never blocking the caller.
    ///
    /// If the dispatch channel is full the event is dropped with a
    /// warning — webhook delivery must not apply backpressure to state
    /// transitions.
    pub fn emit(
        &self,
        target: &WebhookTarget,
        event: &str,
        instance_id: &str,
        data: serde_json::Value,
    ) {
        let job = WebhookJob {
            target: target.clone(),
            event: WebhookEvent {
                event: event.to_owned(),
                instance_id: instance_id.to_owned(),
                data,
                timestamp: Utc::now(),
            },
        };
        if let Err(e) = self.tx.try_send(job) {
            warn!(error = %e, "webhook channel full, dropping event");
        }
    }
}

/// Background delivery worker plus its emission handle.
pub struct WebhookDispatcher {
    sender: WebhookSender,
    task: tokio::task::JoinHandle<()>,
}

impl WebhookDispatcher {
    /// Spawn the delivery worker.
    pub fn spawn(cfg: WebhookConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let task = tokio::spawn(deliver_loop(cfg, rx));
        Self {
            sender: WebhookSender { tx },
            task,
        }
    }

    /// Emission handle for instance actors.
    pub fn sender(&self) -> WebhookSender {
        self.sender.clone()
    }

    /// Stop the worker, giving in-flight deliveries a bounded window to
    /// drain. Cloned senders may still be alive elsewhere, so the worker
    /// is aborted rather than waited on past the bound.
    pub async fn shutdown(self) {
        drop(self.sender);
        let mut task = self.task;
        match tokio::time::timeout(std::time::Duration::from_secs(5), &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "webhook worker task failed"),
            Err(_) => {
                warn!("webhook worker did not drain in time, aborting");
                task.abort();
            }
        }
    }
}

/// Compute the hex HMAC-SHA256 signature for a request body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC-SHA256 accepts keys of any length, so construction cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn deliver_loop(cfg: WebhookConfig, mut rx: mpsc::Receiver<WebhookJob>) {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build webhook HTTP client, using default");
            reqwest::Client::default()
        });

    while let Some(job) = rx.recv().await {
        deliver(&client, &cfg, job).await;
    }
    debug!("webhook worker stopped");
}

/// Deliver one event with a small bounded retry. Failures are logged and
/// the event dropped — indefinite retry policy belongs to the sink side.
async fn deliver(client: &reqwest::Client, cfg: &WebhookConfig, job: WebhookJob) {
    let body = match serde_json::to_vec(&job.event) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to serialize webhook event");
            return;
        }
    };
    let signature = sign(&job.target.secret, &body);

    for attempt in 1..=cfg.max_attempts.max(1) {
        let result = client
            .post(&job.target.url)
            .header(SIGNATURE_HEADER, &signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    event = %job.event.event,
                    instance = %job.event.instance_id,
                    "webhook delivered"
                );
                return;
            }
            Ok(resp) => {
                warn!(
                    event = %job.event.event,
                    instance = %job.event.instance_id,
                    status = %resp.status(),
                    attempt,
                    "webhook sink returned error"
                );
            }
            Err(e) => {
                warn!(
                    event = %job.event.event,
                    instance = %job.event.instance_id,
                    error = %e,
                    attempt,
                    "webhook delivery failed"
                );
            }
        }

        if attempt < cfg.max_attempts {
            tokio::time::sleep(std::time::Duration::from_millis(cfg.retry_delay_ms)).await;
        }
    }

    warn!(
        event = %job.event.event,
        instance = %job.event.instance_id,
        "webhook dropped after exhausting delivery attempts"
    );
}
