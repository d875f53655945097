//! Sequential restore scheduler.
//!
//! At process startup (and on any mass restart) instances are restored
//! one at a time — or at a small configured concurrency — never all at
//! once, so many browser launches cannot stampede host memory. Before
//! each restore the scheduler checks free host memory against a minimum
//! threshold and defers with its own backoff when the host is tight; an
//! instance that exhausts its attempts is reported failed-to-restore and
//! left alone. A cooldown separates successive restores even when
//! resources are plentiful.

use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{info, warn};

use crate::config::RestoreConfig;
use crate::restart::escalating_delay;

/// Probe for free host memory, swappable for tests.
pub trait MemoryProbe: Send + Sync {
    /// Currently available host memory in megabytes.
    fn available_memory_mb(&self) -> u64;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: std::sync::Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    /// Create a probe with an empty system snapshot; memory is refreshed
    /// on every read.
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn available_memory_mb(&self) -> u64 {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_memory();
        system.available_memory() / (1024 * 1024)
    }
}

/// Bookkeeping for one instance's restore attempts.
///
/// Lives only for the duration of the bulk restore; discarded once the
/// instance starts or exhausts its attempts.
#[derive(Debug)]
pub struct RestoreTicket {
    /// Instance being restored.
    pub instance_id: String,
    /// Memory-gate attempts performed so far.
    pub attempt: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Instant,
}

impl RestoreTicket {
    /// Create a ticket ready for an immediate first attempt.
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            attempt: 0,
            next_attempt_at: Instant::now(),
        }
    }
}

/// One failed-to-restore instance with its reason.
#[derive(Debug, Clone)]
pub struct FailedRestore {
    /// Instance that could not be restored.
    pub instance_id: String,
    /// Why it was given up on.
    pub reason: String,
}

/// Outcome of a bulk restore.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Instances whose restore was started.
    pub started: Vec<String>,
    /// Instances given up on.
    pub failed: Vec<FailedRestore>,
}

/// Restore the given instances through `start`, honoring concurrency,
/// the free-memory gate and the inter-restore cooldown.
///
/// `start` performs one instance's restore and resolves when the launch
/// attempt has completed; the scheduler keeps at most
/// `cfg.concurrency` of these futures in flight.
pub async fn run_restore<F, Fut>(
    cfg: &RestoreConfig,
    probe: &dyn MemoryProbe,
    instance_ids: Vec<String>,
    mut start: F,
) -> RestoreReport
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let concurrency = cfg.concurrency.max(1);
    let total = instance_ids.len();
    info!(total, concurrency, "bulk restore starting");

    let mut report = RestoreReport::default();
    let mut in_flight: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();

    for instance_id in instance_ids {
        // Wait for a restore slot.
        while in_flight.len() >= concurrency {
            if let Some(joined) = in_flight.join_next().await {
                collect(&mut report, joined);
            }
        }

        if !admit(cfg, probe, RestoreTicket::new(instance_id.clone())).await {
            report.failed.push(FailedRestore {
                instance_id,
                reason: "insufficient free memory after all attempts".to_owned(),
            });
            continue;
        }

        let fut = start(instance_id.clone());
        in_flight.spawn(async move { (instance_id, fut.await) });

        // Cooldown between successive restores, resources or not.
        sleep(std::time::Duration::from_secs(cfg.cooldown_secs)).await;
    }

    while let Some(joined) = in_flight.join_next().await {
        collect(&mut report, joined);
    }

    info!(
        started = report.started.len(),
        failed = report.failed.len(),
        "bulk restore finished"
    );
    report
}

/// Run the free-memory gate for one ticket. Returns whether the restore
/// may proceed.
async fn admit(cfg: &RestoreConfig, probe: &dyn MemoryProbe, mut ticket: RestoreTicket) -> bool {
    loop {
        sleep_until(ticket.next_attempt_at).await;

        let free_mb = probe.available_memory_mb();
        if free_mb >= cfg.min_free_memory_mb {
            return true;
        }

        ticket.attempt = ticket.attempt.saturating_add(1);
        if ticket.attempt >= cfg.max_attempts {
            warn!(
                instance = %ticket.instance_id,
                free_mb,
                min_mb = cfg.min_free_memory_mb,
                attempts = ticket.attempt,
                "memory gate attempts exhausted, giving up on restore"
            );
            return false;
        }

        let delay = escalating_delay(
            &cfg.retry_backoff_secs,
            usize::try_from(ticket.attempt.saturating_sub(1)).unwrap_or(usize::MAX),
        );
        warn!(
            instance = %ticket.instance_id,
            free_mb,
            min_mb = cfg.min_free_memory_mb,
            retry_secs = delay.as_secs(),
            "free memory below threshold, deferring restore"
        );
        ticket.next_attempt_at = Instant::now().checked_add(delay).unwrap_or_else(Instant::now);
    }
}

fn collect(
    report: &mut RestoreReport,
    joined: Result<(String, anyhow::Result<()>), tokio::task::JoinError>,
) {
    match joined {
        Ok((instance_id, Ok(()))) => report.started.push(instance_id),
        Ok((instance_id, Err(e))) => report.failed.push(FailedRestore {
            instance_id,
            reason: e.to_string(),
        }),
        Err(e) => warn!(error = %e, "restore task failed to join"),
    }
}
