//! Tests for `src/restore.rs` — sequential restore, memory gate, cooldown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use straylight::config::RestoreConfig;
use straylight::restore::{run_restore, MemoryProbe};

/// Probe serving a scripted sequence of readings, then a fallback.
struct SeqProbe {
    values: Mutex<VecDeque<u64>>,
    fallback: u64,
}

impl SeqProbe {
    fn new(values: Vec<u64>, fallback: u64) -> Self {
        Self {
            values: Mutex::new(values.into()),
            fallback,
        }
    }

    fn plenty() -> Self {
        Self::new(Vec::new(), 8192)
    }
}

impl MemoryProbe for SeqProbe {
    fn available_memory_mb(&self) -> u64 {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

fn restore_cfg() -> RestoreConfig {
    RestoreConfig {
        concurrency: 1,
        cooldown_secs: 1,
        min_free_memory_mb: 1024,
        max_attempts: 3,
        retry_backoff_secs: vec![1, 2],
    }
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("inst-{i}")).collect()
}

#[tokio::test(start_paused = true)]
async fn concurrency_one_never_overlaps() {
    let cfg = restore_cfg();
    let probe = SeqProbe::plenty();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let report = run_restore(&cfg, &probe, ids(5), |_id| {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        async move {
            let current = active.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await;

    assert_eq!(report.started.len(), 5);
    assert!(report.failed.is_empty());
    assert_eq!(
        peak.load(Ordering::SeqCst),
        1,
        "two instances must never restore simultaneously"
    );
}

#[tokio::test(start_paused = true)]
async fn configured_concurrency_is_the_ceiling() {
    let mut cfg = restore_cfg();
    cfg.concurrency = 2;
    cfg.cooldown_secs = 0;
    let probe = SeqProbe::plenty();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    run_restore(&cfg, &probe, ids(6), |_id| {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        async move {
            let current = active.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn low_memory_defers_then_admits() {
    let cfg = restore_cfg();
    // Two tight readings, then plenty.
    let probe = SeqProbe::new(vec![100, 200], 8192);

    let started_at = Instant::now();
    let report = run_restore(&cfg, &probe, ids(1), |_id| async move { Ok(()) }).await;

    assert_eq!(report.started.len(), 1);
    assert!(report.failed.is_empty());
    // Two deferrals: 1s then 2s of retry backoff.
    assert!(
        started_at.elapsed() >= Duration::from_secs(3),
        "restore must wait out the memory deferrals"
    );
}

#[tokio::test(start_paused = true)]
async fn memory_exhaustion_reports_failed_to_restore() {
    let cfg = restore_cfg();
    let probe = SeqProbe::new(Vec::new(), 100);

    let calls = Arc::new(AtomicUsize::new(0));
    let report = run_restore(&cfg, &probe, ids(1), |_id| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await;

    assert!(report.started.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].instance_id, "inst-0");
    assert!(report.failed[0].reason.contains("memory"));
    assert_eq!(
        calls.load(Ordering::SeqCst),
        0,
        "a gated-out instance is never started"
    );
}

#[tokio::test(start_paused = true)]
async fn failed_instance_does_not_block_the_rest() {
    let cfg = restore_cfg();
    // First instance sees only tight readings (3 attempts), the second
    // sees plenty.
    let probe = SeqProbe::new(vec![100, 100, 100], 8192);

    let report = run_restore(&cfg, &probe, ids(2), |_id| async move { Ok(()) }).await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.started, vec!["inst-1".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn cooldown_spaces_successive_restores() {
    let mut cfg = restore_cfg();
    cfg.cooldown_secs = 2;
    let probe = SeqProbe::plenty();

    let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    run_restore(&cfg, &probe, ids(3), |_id| {
        let stamps = Arc::clone(&stamps);
        async move {
            stamps
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(Instant::now());
            Ok(())
        }
    })
    .await;

    let stamps = stamps
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(stamps.len(), 3);
    for pair in stamps.windows(2) {
        assert!(
            pair[1].saturating_duration_since(pair[0]) >= Duration::from_secs(2),
            "successive restores must be separated by the cooldown"
        );
    }
}
