//! Shared test support: a deterministic fake automation engine and
//! actor-spawning helpers.

// Not every harness uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use straylight::config::HubConfig;
use straylight::engine::hooks::NoHooks;
use straylight::engine::{
    ChatInfo, EngineError, EngineEvent, InboundMessage, SendReceipt, SessionEngine, SessionHandle,
};
use straylight::instance::actor::{InstanceActor, InstanceCommand};
use straylight::instance::{InstanceDescriptor, InstanceStatus};
use straylight::outbound::idempotency::{IdempotencyStore, QueuedReceipt};
use straylight::outbound::queue::QueueError;
use straylight::outbound::SendPayload;
use straylight::webhook::WebhookDispatcher;

/// Mutable state behind the fake engine.
#[derive(Default)]
pub struct FakeState {
    pub launches: u32,
    pub destroys: u32,
    /// (chat_id, body) pairs in dispatch order.
    pub sent: Vec<(String, String)>,
    pub event_tx: Option<mpsc::Sender<EngineEvent>>,
    /// Result served by `session_identity`.
    pub identity: Option<String>,
    /// When set, `initialize` fails.
    pub fail_launch: bool,
    /// Chats `get_chat_by_id` reports as not found.
    pub unknown_chats: Vec<String>,
    /// Batches served by successive `unread_messages` calls.
    pub unread: VecDeque<Vec<InboundMessage>>,
}

/// Scripted in-process [`SessionEngine`] double.
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Deliver an event on the current session's channel.
    pub async fn push_event(&self, event: EngineEvent) {
        let tx = self
            .lock()
            .event_tx
            .clone()
            .expect("no live session to deliver events to");
        tx.send(event).await.expect("actor dropped event receiver");
    }

    pub fn set_identity(&self, identity: Option<String>) {
        self.lock().identity = identity;
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.lock().fail_launch = fail;
    }

    pub fn push_unread(&self, batch: Vec<InboundMessage>) {
        self.lock().unread.push_back(batch);
    }

    pub fn mark_chat_unknown(&self, chat_id: &str) {
        self.lock().unknown_chats.push(chat_id.to_owned());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.lock().sent.clone()
    }

    pub fn launches(&self) -> u32 {
        self.lock().launches
    }

    pub fn destroys(&self) -> u32 {
        self.lock().destroys
    }
}

#[async_trait]
impl SessionEngine for FakeEngine {
    async fn initialize(
        &self,
        descriptor: &InstanceDescriptor,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<SessionHandle, EngineError> {
        let mut state = self.lock();
        if state.fail_launch {
            return Err(EngineError::LaunchFailed("scripted failure".to_owned()));
        }
        state.launches = state.launches.saturating_add(1);
        state.event_tx = Some(events);
        Ok(SessionHandle::new(format!(
            "fake-{}-{}",
            descriptor.id, state.launches
        )))
    }

    async fn destroy(&self, _handle: SessionHandle) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.destroys = state.destroys.saturating_add(1);
        state.event_tx = None;
        Ok(())
    }

    async fn get_chat_by_id(
        &self,
        _handle: &SessionHandle,
        chat_id: &str,
    ) -> Result<ChatInfo, EngineError> {
        if self.lock().unknown_chats.iter().any(|c| c == chat_id) {
            return Err(EngineError::ChatNotFound(chat_id.to_owned()));
        }
        Ok(ChatInfo {
            chat_id: chat_id.to_owned(),
            name: None,
            is_group: false,
        })
    }

    async fn send_message(
        &self,
        _handle: &SessionHandle,
        chat_id: &str,
        body: &str,
    ) -> Result<SendReceipt, EngineError> {
        let mut state = self.lock();
        state.sent.push((chat_id.to_owned(), body.to_owned()));
        Ok(SendReceipt {
            message_id: format!("m{}", state.sent.len()),
            chat_id: chat_id.to_owned(),
        })
    }

    async fn send_poll(
        &self,
        _handle: &SessionHandle,
        chat_id: &str,
        question: &str,
        _options: &[String],
    ) -> Result<SendReceipt, EngineError> {
        let mut state = self.lock();
        state.sent.push((chat_id.to_owned(), question.to_owned()));
        Ok(SendReceipt {
            message_id: format!("m{}", state.sent.len()),
            chat_id: chat_id.to_owned(),
        })
    }

    async fn set_typing(
        &self,
        _handle: &SessionHandle,
        _chat_id: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn clear_typing(
        &self,
        _handle: &SessionHandle,
        _chat_id: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn mark_seen(&self, _handle: &SessionHandle, _chat_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn session_identity(
        &self,
        _handle: &SessionHandle,
    ) -> Result<Option<String>, EngineError> {
        Ok(self.lock().identity.clone())
    }

    async fn unread_messages(
        &self,
        _handle: &SessionHandle,
    ) -> Result<Vec<InboundMessage>, EngineError> {
        Ok(self.lock().unread.pop_front().unwrap_or_default())
    }
}

/// A config tuned for fast virtual-time tests.
pub fn test_config() -> HubConfig {
    let mut cfg = HubConfig::default();
    cfg.queue.drain_spacing_ms = 100;
    cfg.queue.item_ttl_secs = 600;
    cfg.rate.sends_per_minute = 1000;
    cfg.rate.sends_per_hour = 10_000;
    cfg.disconnect.cooldown_secs = 5;
    cfg.watchdog.ready_poll_interval_secs = 2;
    cfg.watchdog.ready_timeout_secs = 60;
    cfg.watchdog.message_poll_enabled = false;
    cfg.inbound.flush_interval_secs = 2;
    cfg
}

pub fn descriptor(id: &str) -> InstanceDescriptor {
    InstanceDescriptor {
        id: id.to_owned(),
        display_name: id.to_owned(),
        webhook: None,
        created_at: chrono::Utc::now(),
    }
}

/// Everything a spawned test actor needs kept alive.
pub struct ActorFixture {
    pub cmd_tx: mpsc::Sender<InstanceCommand>,
    pub shutdown_tx: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
    /// Holds the idempotency store's temp dir alive.
    pub _data_dir: tempfile::TempDir,
    /// Keeps the webhook worker alive for the fixture's lifetime.
    pub _dispatcher: WebhookDispatcher,
}

/// Spawn an instance actor wired to the fake engine.
pub fn spawn_actor(id: &str, cfg: HubConfig, engine: &FakeEngine) -> ActorFixture {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let cfg = Arc::new(cfg);
    let dispatcher = WebhookDispatcher::spawn(cfg.webhook.clone());
    let idempotency = Arc::new(
        IdempotencyStore::load(
            data_dir.path().join("idempotency.json"),
            cfg.idempotency.ttl_secs,
        )
        .expect("idempotency store"),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (cmd_tx, task) = InstanceActor::spawn(
        descriptor(id),
        cfg,
        Arc::new(engine.clone()),
        Arc::new(NoHooks),
        dispatcher.sender(),
        idempotency,
        shutdown_rx,
    );

    ActorFixture {
        cmd_tx,
        shutdown_tx,
        task,
        _data_dir: data_dir,
        _dispatcher: dispatcher,
    }
}

/// Send `Start` and wait for the launch attempt to complete.
pub async fn start_instance(cmd_tx: &mpsc::Sender<InstanceCommand>) {
    let (reply, ack) = oneshot::channel();
    cmd_tx
        .send(InstanceCommand::Start { reply })
        .await
        .expect("actor alive");
    ack.await.expect("launch ack");
}

/// Snapshot the actor's status.
pub async fn get_status(cmd_tx: &mpsc::Sender<InstanceCommand>) -> InstanceStatus {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(InstanceCommand::Status { reply })
        .await
        .expect("actor alive");
    rx.await.expect("status reply")
}

/// Enqueue a text send.
pub async fn enqueue_text(
    cmd_tx: &mpsc::Sender<InstanceCommand>,
    chat_id: &str,
    body: &str,
) -> Result<QueuedReceipt, QueueError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(InstanceCommand::Enqueue {
            chat_id: chat_id.to_owned(),
            payload: SendPayload::Text {
                body: body.to_owned(),
            },
            idempotency_key: None,
            reply,
        })
        .await
        .expect("actor alive");
    rx.await.expect("enqueue reply")
}

/// Yield to the actor and let virtual time advance a little.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
