//! The single-threaded actor loop owning one instance.
//!
//! All transitions for an instance are serialized through its command
//! and event channels — the machine is never touched concurrently with
//! itself. Timers live in one [`TimerSet`]; the loop sleeps until the
//! earliest armed deadline. Every engine call is wrapped in a hard
//! timeout and folded into the instance's last-error value on failure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::machine::{Effect, ReadySource, StateMachine};
use super::timers::{TimerKind, TimerSet};
use super::{InstanceDescriptor, InstanceStatus};
use crate::config::HubConfig;
use crate::engine::hooks::SendHooks;
use crate::engine::{EngineEvent, InboundMessage, SessionEngine, SessionHandle};
use crate::inbound::InboundBuffer;
use crate::outbound::idempotency::{IdempotencyStore, QueuedReceipt};
use crate::outbound::limiter::RateLimiter;
use crate::outbound::queue::{OutboundQueue, Pop, QueueError, QueuedSend};
use crate::outbound::SendPayload;
use crate::restart::{escalating_delay, with_jitter, RestartController};
use crate::webhook::WebhookSender;

/// Capacity of the per-session engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the actor command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Commands accepted by an instance actor.
#[derive(Debug)]
pub enum InstanceCommand {
    /// Begin connecting (create or restore path).
    Start {
        /// Resolved once the launch attempt has completed (successfully
        /// or not), so the restore scheduler can serialize launches.
        reply: oneshot::Sender<()>,
    },
    /// Enqueue an outbound send.
    Enqueue {
        /// Destination chat.
        chat_id: String,
        /// What to send.
        payload: SendPayload,
        /// Caller-supplied idempotency key, if any. The record is written
        /// before the drain can dispatch the item.
        idempotency_key: Option<String>,
        /// Resolved with the queue receipt or the rejection.
        reply: oneshot::Sender<Result<QueuedReceipt, QueueError>>,
    },
    /// Snapshot the instance status.
    Status {
        /// Resolved with the snapshot.
        reply: oneshot::Sender<InstanceStatus>,
    },
    /// Gracefully destroy the session and stop the actor.
    Delete {
        /// Resolved once the destroy attempt finished (or timed out).
        reply: oneshot::Sender<()>,
    },
}

/// One instance's actor: state machine, timers, queue, limiter, buffer.
pub struct InstanceActor {
    descriptor: InstanceDescriptor,
    cfg: Arc<HubConfig>,
    engine: Arc<dyn SessionEngine>,
    hooks: Arc<dyn SendHooks>,
    webhooks: WebhookSender,
    idempotency: Arc<IdempotencyStore>,

    machine: StateMachine,
    timers: TimerSet,
    queue: OutboundQueue,
    limiter: RateLimiter,
    inbound: InboundBuffer,
    restarts: RestartController,

    handle: Option<SessionHandle>,
    events: Option<mpsc::Receiver<EngineEvent>>,

    cmd_rx: mpsc::Receiver<InstanceCommand>,
    shutdown: watch::Receiver<bool>,
}

impl InstanceActor {
    /// Spawn the actor task for an instance.
    ///
    /// Returns the command sender and the task handle. The actor exits on
    /// [`InstanceCommand::Delete`], when the command channel closes, or
    /// when the shutdown signal flips.
    pub fn spawn(
        descriptor: InstanceDescriptor,
        cfg: Arc<HubConfig>,
        engine: Arc<dyn SessionEngine>,
        hooks: Arc<dyn SendHooks>,
        webhooks: WebhookSender,
        idempotency: Arc<IdempotencyStore>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Sender<InstanceCommand>, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let now = Instant::now();

        let actor = Self {
            machine: StateMachine::new(descriptor.id.clone(), Arc::clone(&cfg), now),
            timers: TimerSet::new(),
            queue: OutboundQueue::new(cfg.queue.max_len),
            limiter: RateLimiter::new(&cfg.rate, now),
            inbound: InboundBuffer::new(cfg.inbound.max_len, cfg.inbound.batch_size),
            restarts: RestartController::new(cfg.restart.clone()),
            handle: None,
            events: None,
            descriptor,
            cfg,
            engine,
            hooks,
            webhooks,
            idempotency,
            cmd_rx,
            shutdown,
        };

        let task = tokio::spawn(actor.run());
        (cmd_tx, task)
    }

    async fn run(mut self) {
        info!(instance = %self.descriptor.id, "instance actor started");
        self.timers.arm(
            TimerKind::HealthCheck,
            Instant::now(),
            Duration::from_secs(self.cfg.health.check_interval_secs),
        );

        loop {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    None => {
                        self.destroy_session().await;
                        break;
                    }
                    Some(InstanceCommand::Delete { reply }) => {
                        self.graceful_delete().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = recv_engine_event(&mut self.events) => match event {
                    Some(ev) => self.handle_engine_event(ev).await,
                    None => self.handle_event_stream_closed().await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now();
                    for kind in self.timers.fire_due(now) {
                        self.handle_timer(kind, now).await;
                    }
                }
                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        info!(instance = %self.descriptor.id, "shutdown signal received");
                        self.destroy_session().await;
                        break;
                    }
                }
            }
        }

        info!(instance = %self.descriptor.id, "instance actor stopped");
    }

    // ── Commands ────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: InstanceCommand) {
        match cmd {
            InstanceCommand::Start { reply } => {
                let effects = self.machine.on_launch(Instant::now());
                self.apply_effects(effects).await;
                let _ = reply.send(());
            }
            InstanceCommand::Enqueue {
                chat_id,
                payload,
                idempotency_key,
                reply,
            } => {
                let result = self.enqueue(chat_id, payload, idempotency_key).await;
                let _ = reply.send(result);
            }
            InstanceCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            InstanceCommand::Delete { .. } => unreachable!("handled in run loop"),
        }
    }

    async fn enqueue(
        &mut self,
        chat_id: String,
        payload: SendPayload,
        idempotency_key: Option<String>,
    ) -> Result<QueuedReceipt, QueueError> {
        let now = Instant::now();
        let enqueued_at = chrono::Utc::now();
        let item = QueuedSend {
            id: uuid::Uuid::new_v4(),
            chat_id,
            payload,
            enqueued_at,
            deadline: now
                .checked_add(self.cfg.queue.item_ttl())
                .unwrap_or(now),
        };
        let item_id = item.id;
        self.queue.push(item)?;

        let receipt = QueuedReceipt {
            item_id,
            enqueued_at,
        };

        // The record must exist before the drain can dispatch the item;
        // the actor is single-threaded, so awaiting the write here is
        // enough to guarantee that ordering.
        if let Some(key) = idempotency_key {
            if let Err(e) = self.idempotency.record(&key, receipt.clone()).await {
                warn!(
                    instance = %self.descriptor.id,
                    error = %e,
                    "failed to persist idempotency record"
                );
            }
        }

        // Kick the drain if the instance can send right now.
        if self.machine.state().can_drain() && !self.timers.is_armed(TimerKind::Drain) {
            self.timers.arm(TimerKind::Drain, now, Duration::ZERO);
        }

        Ok(receipt)
    }

    fn status(&self) -> InstanceStatus {
        let now = Instant::now();
        InstanceStatus {
            id: self.descriptor.id.clone(),
            display_name: self.descriptor.display_name.clone(),
            state: self.machine.state(),
            queue_len: self.queue.len(),
            inbound_len: self.inbound.len(),
            restart_count: self.restarts.restart_count(now),
            qr_attempt: self.machine.qr().map(|qr| qr.attempt),
            qr_stale: self.machine.qr_stale(now),
            zombie_flagged: self.machine.zombie_flagged(),
            last_error: self.machine.last_error().cloned(),
            idle_secs: self.machine.idle_secs(now),
        }
    }

    // ── Engine events ───────────────────────────────────────────

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        let now = Instant::now();
        match event {
            EngineEvent::Qr { code } => {
                let effects = self.machine.on_qr(now);
                self.apply_effects(effects).await;
                self.emit_webhook("qr", json!({ "code": code }));
            }
            EngineEvent::Authenticated => {
                let effects = self.machine.on_authenticated(now);
                self.apply_effects(effects).await;
            }
            EngineEvent::Ready => {
                let effects = self.machine.on_ready(now, ReadySource::Event);
                self.apply_effects(effects).await;
            }
            EngineEvent::StateChange { state } => {
                debug!(instance = %self.descriptor.id, engine_state = %state, "engine state change");
                self.machine.record_activity(now);
            }
            EngineEvent::Disconnected { reason } => {
                let effects = self.machine.on_disconnected(reason.as_deref(), now);
                self.apply_effects(effects).await;
            }
            EngineEvent::AuthFailure { reason } => {
                self.machine.record_error(format!("auth failure: {reason}"));
                let effects = self.machine.on_disconnected(Some(&reason), now);
                self.apply_effects(effects).await;
            }
            EngineEvent::Message(msg) => {
                self.handle_message(msg).await;
            }
        }
    }

    /// The engine's event stream closed while the session was supposed
    /// to be alive. Silent event loss is exactly what the poll fallbacks
    /// exist for, but a closed channel is unambiguous: distrust the
    /// session and take the disconnect path.
    async fn handle_event_stream_closed(&mut self) {
        self.events = None;
        if self.handle.is_some() {
            warn!(instance = %self.descriptor.id, "engine event stream closed unexpectedly");
            let effects = self
                .machine
                .on_disconnected(Some("event stream closed"), Instant::now());
            self.apply_effects(effects).await;
        }
    }

    async fn handle_message(&mut self, msg: InboundMessage) {
        if self.machine.state().is_reduced_capacity() {
            if let Some(dropped) = self.inbound.push(EngineEvent::Message(msg)) {
                debug!(
                    instance = %self.descriptor.id,
                    received_at = %dropped.received_at,
                    "inbound buffer full, dropped oldest entry"
                );
            }
            if self.inbound.batch_ready() {
                self.flush_inbound_batch();
            } else if !self.timers.is_armed(TimerKind::InboundFlush) {
                self.timers.arm(
                    TimerKind::InboundFlush,
                    Instant::now(),
                    self.cfg.inbound.flush_interval(),
                );
            }
        } else {
            self.process_message(msg);
        }
    }

    fn process_message(&mut self, msg: InboundMessage) {
        self.machine.record_activity(Instant::now());
        match serde_json::to_value(&msg) {
            Ok(data) => self.emit_webhook("message", data),
            Err(e) => warn!(instance = %self.descriptor.id, error = %e, "failed to encode inbound message"),
        }
    }

    fn flush_inbound_batch(&mut self) {
        for entry in self.inbound.drain_batch() {
            if let EngineEvent::Message(msg) = entry.event {
                self.process_message(msg);
            }
        }
        if self.inbound.is_empty() {
            self.timers.cancel(TimerKind::InboundFlush);
        } else {
            self.timers.arm(
                TimerKind::InboundFlush,
                Instant::now(),
                self.cfg.inbound.flush_interval(),
            );
        }
    }

    // ── Timers ──────────────────────────────────────────────────

    async fn handle_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::ConnectingWatchdog => {
                let effects = self.machine.on_connecting_watchdog(now);
                self.apply_effects(effects).await;
            }
            TimerKind::ReadyWatchdog => {
                let effects = self.machine.on_ready_watchdog(now);
                self.apply_effects(effects).await;
            }
            TimerKind::ReadyPoll => self.ready_poll().await,
            TimerKind::QrTtl => {
                let effects = self.machine.on_qr_ttl(now);
                self.apply_effects(effects).await;
            }
            TimerKind::MessagePoll => self.message_poll().await,
            TimerKind::InboundFlush => self.flush_inbound_batch(),
            TimerKind::Reconnect => {
                let effects = self.machine.on_reconnect_due(now);
                self.apply_effects(effects).await;
            }
            TimerKind::Drain => self.drain_tick().await,
            TimerKind::HealthCheck => {
                self.machine.on_health_check(now);
                self.timers.arm(
                    TimerKind::HealthCheck,
                    now,
                    Duration::from_secs(self.cfg.health.check_interval_secs),
                );
            }
        }
    }

    /// Ready-poll fallback: a positive identity result is accepted as
    /// proof of readiness even though the `ready` event never fired.
    async fn ready_poll(&mut self) {
        let Some(handle) = self.handle.clone() else {
            return;
        };

        let result = timeout(
            self.cfg.engine.lookup_timeout(),
            self.engine.session_identity(&handle),
        )
        .await;

        match result {
            Ok(Ok(Some(identity))) => {
                debug!(instance = %self.descriptor.id, %identity, "ready poll succeeded");
                let effects = self.machine.on_ready(Instant::now(), ReadySource::Poll);
                self.apply_effects(effects).await;
                return;
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                debug!(instance = %self.descriptor.id, error = %e, "ready poll failed")
            }
            Err(_) => {
                debug!(instance = %self.descriptor.id, "ready poll timed out")
            }
        }

        // Still syncing: keep polling until the watchdog decides.
        if self.machine.state() == super::InstanceState::Syncing {
            self.timers.arm(
                TimerKind::ReadyPoll,
                Instant::now(),
                Duration::from_secs(self.cfg.watchdog.ready_poll_interval_secs),
            );
        }
    }

    /// Message-fallback poll: inbound events may silently stop firing,
    /// so unread messages are fetched on a fixed interval while active.
    async fn message_poll(&mut self) {
        if self.machine.state() != super::InstanceState::Active {
            return;
        }
        let Some(handle) = self.handle.clone() else {
            return;
        };

        let result = timeout(
            self.cfg.engine.lookup_timeout(),
            self.engine.unread_messages(&handle),
        )
        .await;

        match result {
            Ok(Ok(messages)) => {
                for msg in messages {
                    self.process_message(msg);
                }
            }
            Ok(Err(e)) => {
                debug!(instance = %self.descriptor.id, error = %e, "message poll failed")
            }
            Err(_) => debug!(instance = %self.descriptor.id, "message poll timed out"),
        }

        if self.machine.state() == super::InstanceState::Active {
            self.timers.arm(
                TimerKind::MessagePoll,
                Instant::now(),
                Duration::from_secs(self.cfg.watchdog.message_poll_interval_secs),
            );
        }
    }

    // ── Effects ─────────────────────────────────────────────────

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        let mut work: VecDeque<Effect> = effects.into();
        while let Some(effect) = work.pop_front() {
            match effect {
                Effect::LaunchSession => {
                    let follow_ups = self.launch().await;
                    work.extend(follow_ups);
                }
                Effect::DestroySession => self.destroy_session().await,
                Effect::Arm(kind, delay) => self.timers.arm(kind, Instant::now(), delay),
                Effect::Cancel(kind) => self.timers.cancel(kind),
                Effect::PauseDrain => self.timers.cancel(TimerKind::Drain),
                Effect::ResumeDrain => {
                    // Entries buffered during the reduced-capacity phase
                    // re-enter normal processing now.
                    for entry in self.inbound.drain_all() {
                        if let EngineEvent::Message(msg) = entry.event {
                            self.process_message(msg);
                        }
                    }
                    self.timers.cancel(TimerKind::InboundFlush);
                    self.timers.arm(TimerKind::Drain, Instant::now(), Duration::ZERO);
                }
                Effect::ScheduleRestart => {
                    let decision = self.restarts.next_delay(Instant::now());
                    let delay = with_jitter(decision.delay);
                    if decision.window_exhausted {
                        warn!(
                            instance = %self.descriptor.id,
                            delay_secs = delay.as_secs(),
                            "restart window exhausted, applying extended pause"
                        );
                    } else {
                        info!(
                            instance = %self.descriptor.id,
                            delay_secs = delay.as_secs(),
                            "restart scheduled"
                        );
                    }
                    self.timers.arm(TimerKind::Reconnect, Instant::now(), delay);
                }
                Effect::ScheduleQrRecovery { attempt } => {
                    let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
                    let delay = with_jitter(escalating_delay(
                        &self.cfg.qr.recovery_backoff_secs,
                        index,
                    ));
                    info!(
                        instance = %self.descriptor.id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "qr recovery scheduled"
                    );
                    self.timers.arm(TimerKind::Reconnect, Instant::now(), delay);
                }
                Effect::Notify { event, data } => self.emit_webhook(event, data),
            }
        }
    }

    /// Launch a fresh engine session. Returns follow-up effects when the
    /// launch fails; an empty vec on success.
    async fn launch(&mut self) -> Vec<Effect> {
        // At most one live session per instance: tear down any survivor
        // before launching.
        self.destroy_session().await;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let result = timeout(
            self.cfg.engine.launch_timeout(),
            self.engine.initialize(&self.descriptor, event_tx),
        )
        .await;

        match result {
            Ok(Ok(handle)) => {
                info!(instance = %self.descriptor.id, handle = handle.id(), "session launched");
                self.handle = Some(handle);
                self.events = Some(event_rx);
                Vec::new()
            }
            Ok(Err(e)) => {
                warn!(instance = %self.descriptor.id, error = %e, "session launch failed");
                self.machine
                    .on_launch_failed(&e.to_string(), Instant::now())
            }
            Err(_) => {
                warn!(instance = %self.descriptor.id, "session launch timed out");
                self.machine
                    .on_launch_failed("session launch timed out", Instant::now())
            }
        }
    }

    /// Destroy the current session within the bounded destroy timeout.
    async fn destroy_session(&mut self) {
        self.events = None;
        let Some(handle) = self.handle.take() else {
            return;
        };

        match timeout(
            self.cfg.engine.destroy_timeout(),
            self.engine.destroy(handle),
        )
        .await
        {
            Ok(Ok(())) => debug!(instance = %self.descriptor.id, "session destroyed"),
            Ok(Err(e)) => {
                warn!(instance = %self.descriptor.id, error = %e, "session destroy failed")
            }
            Err(_) => {
                warn!(instance = %self.descriptor.id, "session destroy timed out, resources force-purged")
            }
        }
    }

    /// Delete path: graceful destroy, then discard all pending work.
    async fn graceful_delete(&mut self) {
        self.destroy_session().await;
        let discarded = self.queue.clear();
        if discarded > 0 {
            info!(
                instance = %self.descriptor.id,
                discarded,
                "discarded queued work on delete"
            );
        }
        self.timers.cancel_all();
    }

    // ── Outbound drain ──────────────────────────────────────────

    /// One drain step: at most one send per tick, spaced by the
    /// configured minimum gap.
    async fn drain_tick(&mut self) {
        if !self.machine.state().can_drain() {
            return;
        }

        loop {
            let now = Instant::now();
            match self.queue.pop_next(now) {
                Pop::Empty => return,
                Pop::Expired(item) => {
                    warn!(
                        instance = %self.descriptor.id,
                        item_id = %item.id,
                        chat_id = %item.chat_id,
                        "dropping expired outbound item"
                    );
                    continue;
                }
                Pop::Item(item) => {
                    match self.limiter.try_acquire(now) {
                        Err(retry_after) => {
                            // Deferred, not dropped: back at the head until
                            // the binding window rolls over.
                            debug!(
                                instance = %self.descriptor.id,
                                defer_secs = retry_after.as_secs(),
                                "send rate limited, deferring"
                            );
                            self.queue.push_front(item);
                            self.timers.arm(TimerKind::Drain, now, retry_after);
                        }
                        Ok(()) => {
                            self.dispatch(item).await;
                            self.timers
                                .arm(TimerKind::Drain, now, self.cfg.queue.drain_spacing());
                        }
                    }
                    return;
                }
            }
        }
    }

    async fn dispatch(&mut self, item: QueuedSend) {
        let Some(handle) = self.handle.clone() else {
            self.queue.push_front(item);
            return;
        };

        // Resolve the chat first: an unknown chat is a permanent failure
        // for this item, anything else is worth a retry.
        match timeout(
            self.cfg.engine.lookup_timeout(),
            self.engine.get_chat_by_id(&handle, &item.chat_id),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(crate::engine::EngineError::ChatNotFound(chat_id))) => {
                warn!(
                    instance = %self.descriptor.id,
                    item_id = %item.id,
                    chat_id = %chat_id,
                    "chat not found, dropping outbound item"
                );
                self.machine
                    .record_error(format!("chat not found: {chat_id}"));
                return;
            }
            Ok(Err(e)) => {
                debug!(instance = %self.descriptor.id, error = %e, "chat lookup failed, re-queueing");
                self.queue.push_front(item);
                return;
            }
            Err(_) => {
                debug!(instance = %self.descriptor.id, "chat lookup timed out, re-queueing");
                self.queue.push_front(item);
                return;
            }
        }

        if let Err(e) = self
            .hooks
            .before_send(self.engine.as_ref(), &handle, &item.chat_id)
            .await
        {
            debug!(instance = %self.descriptor.id, error = %e, "before-send hook failed");
        }

        let send_timeout = self.cfg.engine.send_timeout();
        let result = match &item.payload {
            SendPayload::Text { body } => {
                timeout(
                    send_timeout,
                    self.engine.send_message(&handle, &item.chat_id, body),
                )
                .await
            }
            SendPayload::Poll { question, options } => {
                timeout(
                    send_timeout,
                    self.engine
                        .send_poll(&handle, &item.chat_id, question, options),
                )
                .await
            }
        };

        match result {
            Ok(Ok(receipt)) => {
                debug!(
                    instance = %self.descriptor.id,
                    item_id = %item.id,
                    message_id = %receipt.message_id,
                    "outbound item sent"
                );
                self.machine.record_activity(Instant::now());
                if let Err(e) = self
                    .hooks
                    .after_send(self.engine.as_ref(), &handle, &item.chat_id)
                    .await
                {
                    debug!(instance = %self.descriptor.id, error = %e, "after-send hook failed");
                }
            }
            Ok(Err(e)) => {
                warn!(
                    instance = %self.descriptor.id,
                    item_id = %item.id,
                    error = %e,
                    "send failed, re-queueing"
                );
                self.machine.record_error(format!("send failed: {e}"));
                self.queue.push_front(item);
            }
            Err(_) => {
                warn!(
                    instance = %self.descriptor.id,
                    item_id = %item.id,
                    "send timed out, re-queueing"
                );
                self.machine.record_error("send timed out");
                self.queue.push_front(item);
            }
        }
    }

    fn emit_webhook(&self, event: &'static str, data: serde_json::Value) {
        if let Some(target) = &self.descriptor.webhook {
            self.webhooks
                .emit(target, event, &self.descriptor.id, data);
        }
    }
}

/// Receive the next engine event, or pend forever when no session is live.
async fn recv_engine_event(events: &mut Option<mpsc::Receiver<EngineEvent>>) -> Option<EngineEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
