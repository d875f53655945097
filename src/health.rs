//! Hub health snapshot and the background health loop.
//!
//! Each tick gathers every instance's status and writes an atomic
//! `health.json` to disk; the `status` subcommand and external monitors
//! read it without touching the running hub.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::instance::{InstanceState, InstanceStatus};
use crate::registry::InstanceRegistry;
use crate::store;

/// Health report written to `health.json` each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubHealthReport {
    /// Overall hub status.
    pub status: String,
    /// Seconds since process start.
    pub uptime_secs: u64,
    /// ISO 8601 timestamp of this report.
    pub last_heartbeat: String,
    /// Registered instance count.
    pub instance_count: usize,
    /// Instances currently active.
    pub active_count: usize,
    /// Instances in the terminal error state.
    pub error_count: usize,
    /// Per-instance snapshots.
    pub instances: Vec<InstanceStatus>,
}

/// Build a report from instance snapshots.
pub fn build_report(instances: Vec<InstanceStatus>, start_time: Instant) -> HubHealthReport {
    let active_count = instances
        .iter()
        .filter(|s| s.state == InstanceState::Active)
        .count();
    let error_count = instances
        .iter()
        .filter(|s| s.state == InstanceState::Error)
        .count();
    let degraded = error_count > 0 || instances.iter().any(|s| s.zombie_flagged);

    HubHealthReport {
        status: if degraded { "degraded" } else { "running" }.to_owned(),
        uptime_secs: start_time.elapsed().as_secs(),
        last_heartbeat: chrono::Utc::now().to_rfc3339(),
        instance_count: instances.len(),
        active_count,
        error_count,
        instances,
    }
}

/// Read a previously written health report.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_health_file(path: &Path) -> anyhow::Result<HubHealthReport> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read health file at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse health file at {}", path.display()))
}

/// Run the health background loop.
///
/// Ticks at the configured interval; each tick fans out status requests
/// and writes `health.json` atomically. Exits when the shutdown signal
/// flips or the watch channel closes.
pub async fn run_health_loop(
    registry: Arc<InstanceRegistry>,
    path: PathBuf,
    interval_secs: u64,
    start_time: Instant,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs, "health loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = build_report(registry.statuses().await, start_time);
                if let Err(e) = store::write_snapshot(&report, &path).await {
                    warn!(error = %e, "failed to write health.json");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("health loop shutting down");
                    break;
                }
            }
        }
    }
}
