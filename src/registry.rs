//! Instance registry: the composition root.
//!
//! Owns every instance's actor, routes commands to them, and persists the
//! ordered instance list. There is no ambient singleton — the registry is
//! an explicit object handed by reference to whoever needs it. External
//! maintenance tooling reads the persisted list to decide which session
//! directories are orphaned; the registry never invokes that tooling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::engine::hooks::SendHooks;
use crate::engine::SessionEngine;
use crate::instance::actor::{InstanceActor, InstanceCommand};
use crate::instance::{InstanceDescriptor, InstanceStatus, WebhookTarget};
use crate::outbound::idempotency::{IdempotencyStore, QueuedReceipt};
use crate::outbound::queue::QueueError;
use crate::outbound::SendPayload;
use crate::restore::{self, MemoryProbe, RestoreReport};
use crate::store;
use crate::webhook::WebhookSender;

/// Extra slack on top of the engine destroy timeout when waiting for a
/// deleted actor to wind down before force-aborting it.
const DELETE_GRACE: Duration = Duration::from_secs(5);

/// How long a status fan-out waits on one instance before skipping it.
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from the registry surface.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No instance with the given id.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// An instance with the given id already exists.
    #[error("instance already exists: {0}")]
    DuplicateInstance(String),

    /// The outbound queue rejected the item.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The instance actor is not accepting commands.
    #[error("instance is not accepting commands")]
    Unavailable,

    /// Persisting hub state failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

struct InstanceHandle {
    descriptor: InstanceDescriptor,
    cmd_tx: mpsc::Sender<InstanceCommand>,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    /// Creation order, mirrored into the persisted list.
    order: Vec<String>,
    handles: HashMap<String, InstanceHandle>,
}

/// Owns all instance state and the channels into each actor.
pub struct InstanceRegistry {
    cfg: Arc<HubConfig>,
    engine: Arc<dyn SessionEngine>,
    hooks: Arc<dyn SendHooks>,
    webhooks: WebhookSender,
    idempotency: Arc<IdempotencyStore>,
    instances_path: PathBuf,
    shutdown_rx: watch::Receiver<bool>,
    inner: RwLock<Inner>,
}

impl InstanceRegistry {
    /// Create an empty registry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<HubConfig>,
        engine: Arc<dyn SessionEngine>,
        hooks: Arc<dyn SendHooks>,
        webhooks: WebhookSender,
        idempotency: Arc<IdempotencyStore>,
        instances_path: PathBuf,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            engine,
            hooks,
            webhooks,
            idempotency,
            instances_path,
            shutdown_rx,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Load the persisted instance list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_descriptors(path: &std::path::Path) -> anyhow::Result<Vec<InstanceDescriptor>> {
        store::load_snapshot(path)
    }

    /// Register an instance and spawn its actor, without launching it.
    ///
    /// Used at boot for every persisted descriptor; the restore scheduler
    /// launches them afterwards, one at a time.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateInstance`] if the id is taken.
    pub async fn register(&self, descriptor: InstanceDescriptor) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.handles.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateInstance(descriptor.id));
        }

        let (cmd_tx, task) = InstanceActor::spawn(
            descriptor.clone(),
            Arc::clone(&self.cfg),
            Arc::clone(&self.engine),
            Arc::clone(&self.hooks),
            self.webhooks.clone(),
            Arc::clone(&self.idempotency),
            self.shutdown_rx.clone(),
        );

        inner.order.push(descriptor.id.clone());
        inner.handles.insert(
            descriptor.id.clone(),
            InstanceHandle {
                descriptor,
                cmd_tx,
                task,
            },
        );
        Ok(())
    }

    /// Create a new instance: register, persist, and launch it.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate id, persistence failure, or when the
    /// actor cannot be reached.
    pub async fn create_instance(
        &self,
        id: String,
        display_name: String,
        webhook: Option<WebhookTarget>,
    ) -> Result<InstanceDescriptor, RegistryError> {
        let descriptor = InstanceDescriptor {
            id: id.clone(),
            display_name,
            webhook,
            created_at: chrono::Utc::now(),
        };

        self.register(descriptor.clone()).await?;
        self.persist().await?;
        self.start_instance(&id).await?;

        info!(instance = %id, "instance created");
        Ok(descriptor)
    }

    /// Launch (or relaunch) an instance, waiting for the launch attempt
    /// to complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is unknown or its actor stopped.
    pub async fn start_instance(&self, id: &str) -> Result<(), RegistryError> {
        let cmd_tx = self.cmd_tx(id).await?;
        let (reply, ack) = oneshot::channel();
        cmd_tx
            .send(InstanceCommand::Start { reply })
            .await
            .map_err(|_| RegistryError::Unavailable)?;
        ack.await.map_err(|_| RegistryError::Unavailable)?;
        Ok(())
    }

    /// Queue an outbound send on an instance.
    ///
    /// When `idempotency_key` is supplied and a matching unexpired record
    /// exists, the cached receipt is returned and nothing is enqueued —
    /// the at-most-once path.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is unknown, its queue is full, or
    /// its actor stopped.
    pub async fn send(
        &self,
        id: &str,
        chat_id: String,
        payload: SendPayload,
        idempotency_key: Option<String>,
    ) -> Result<QueuedReceipt, RegistryError> {
        if let Some(key) = idempotency_key.as_deref() {
            if let Some(cached) = self.idempotency.lookup(key) {
                debug!(instance = %id, key, "idempotency hit, returning cached receipt");
                return Ok(cached);
            }
        }

        let cmd_tx = self.cmd_tx(id).await?;
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(InstanceCommand::Enqueue {
                chat_id,
                payload,
                idempotency_key,
                reply,
            })
            .await
            .map_err(|_| RegistryError::Unavailable)?;

        let receipt = rx.await.map_err(|_| RegistryError::Unavailable)??;
        Ok(receipt)
    }

    /// Snapshot one instance's status.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is unknown or unresponsive.
    pub async fn status(&self, id: &str) -> Result<InstanceStatus, RegistryError> {
        let cmd_tx = self.cmd_tx(id).await?;
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(InstanceCommand::Status { reply })
            .await
            .map_err(|_| RegistryError::Unavailable)?;
        rx.await.map_err(|_| RegistryError::Unavailable)
    }

    /// Snapshot every instance's status, skipping unresponsive actors.
    pub async fn statuses(&self) -> Vec<InstanceStatus> {
        let targets: Vec<(String, mpsc::Sender<InstanceCommand>)> = {
            let inner = self.inner.read().await;
            inner
                .order
                .iter()
                .filter_map(|id| {
                    inner
                        .handles
                        .get(id)
                        .map(|h| (id.clone(), h.cmd_tx.clone()))
                })
                .collect()
        };

        let mut out = Vec::with_capacity(targets.len());
        for (id, cmd_tx) in targets {
            let (reply, rx) = oneshot::channel();
            if cmd_tx.send(InstanceCommand::Status { reply }).await.is_err() {
                warn!(instance = %id, "actor unreachable during status fan-out");
                continue;
            }
            match timeout(STATUS_TIMEOUT, rx).await {
                Ok(Ok(status)) => out.push(status),
                _ => warn!(instance = %id, "status request timed out"),
            }
        }
        out
    }

    /// Delete an instance: graceful session destroy within a bounded
    /// timeout, then force-purge.
    ///
    /// Past the timeout, cancellation is immediate: the actor task is
    /// aborted, and its queued work is discarded with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is unknown or the list cannot be
    /// persisted.
    pub async fn delete_instance(&self, id: &str) -> Result<(), RegistryError> {
        let handle = {
            let mut inner = self.inner.write().await;
            inner.order.retain(|existing| existing.as_str() != id);
            inner
                .handles
                .remove(id)
                .ok_or_else(|| RegistryError::UnknownInstance(id.to_owned()))?
        };
        self.persist().await?;

        let (reply, done) = oneshot::channel();
        let graceful = handle
            .cmd_tx
            .send(InstanceCommand::Delete { reply })
            .await
            .is_ok();

        let wait = self
            .cfg
            .engine
            .destroy_timeout()
            .saturating_add(DELETE_GRACE);
        if graceful && timeout(wait, done).await.is_ok() {
            info!(instance = %id, "instance deleted gracefully");
        } else {
            warn!(instance = %id, "graceful delete timed out, force-purging");
            handle.task.abort();
        }
        Ok(())
    }

    /// Restore every registered instance through the sequential restore
    /// scheduler, in persisted order.
    pub async fn restore_all(&self, probe: &dyn MemoryProbe) -> RestoreReport {
        let (ordered_ids, senders) = {
            let inner = self.inner.read().await;
            let senders: HashMap<String, mpsc::Sender<InstanceCommand>> = inner
                .handles
                .iter()
                .map(|(id, h)| (id.clone(), h.cmd_tx.clone()))
                .collect();
            (inner.order.clone(), senders)
        };

        restore::run_restore(&self.cfg.restore, probe, ordered_ids, move |id| {
            let cmd_tx = senders.get(&id).cloned();
            async move {
                let cmd_tx =
                    cmd_tx.ok_or_else(|| anyhow::anyhow!("instance disappeared before restore"))?;
                let (reply, ack) = oneshot::channel();
                cmd_tx
                    .send(InstanceCommand::Start { reply })
                    .await
                    .map_err(|_| anyhow::anyhow!("instance actor stopped"))?;
                ack.await
                    .map_err(|_| anyhow::anyhow!("instance actor dropped launch ack"))?;
                Ok(())
            }
        })
        .await
    }

    /// Wait for every actor to wind down after the shutdown signal flips,
    /// aborting stragglers past the bound.
    pub async fn join_all(&self, wait: Duration) {
        let handles: Vec<(String, tokio::task::JoinHandle<()>)> = {
            let mut inner = self.inner.write().await;
            inner.order.clear();
            inner
                .handles
                .drain()
                .map(|(id, h)| (id, h.task))
                .collect()
        };

        for (id, mut task) in handles {
            match timeout(wait, &mut task).await {
                Ok(Ok(())) => debug!(instance = %id, "actor joined"),
                Ok(Err(e)) => warn!(instance = %id, error = %e, "actor task failed"),
                Err(_) => {
                    warn!(instance = %id, "actor did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }

    /// Number of registered instances.
    pub async fn len(&self) -> usize {
        self.inner.read().await.handles.len()
    }

    /// Whether no instances are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn cmd_tx(&self, id: &str) -> Result<mpsc::Sender<InstanceCommand>, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .handles
            .get(id)
            .map(|h| h.cmd_tx.clone())
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_owned()))
    }

    /// Persist the ordered descriptor list atomically.
    async fn persist(&self) -> anyhow::Result<()> {
        let descriptors: Vec<InstanceDescriptor> = {
            let inner = self.inner.read().await;
            inner
                .order
                .iter()
                .filter_map(|id| inner.handles.get(id).map(|h| h.descriptor.clone()))
                .collect()
        };
        store::write_snapshot(&descriptors, &self.instances_path).await
    }
}
