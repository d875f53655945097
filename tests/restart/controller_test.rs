//! Tests for `src/restart.rs` — escalating backoff, the sliding restart
//! window, and the extended pause once the window cap is exceeded.

use std::time::Duration;

use tokio::time::Instant;

use straylight::config::RestartConfig;
use straylight::restart::{escalating_delay, with_jitter, RestartController};

fn policy() -> RestartConfig {
    RestartConfig {
        backoff_secs: vec![10, 60, 300],
        window_minutes: 60,
        max_per_window: 2,
        extra_pause_hours: 3,
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_sequence_escalates_and_clamps() {
    let mut controller = RestartController::new(RestartConfig {
        max_per_window: 100,
        ..policy()
    });
    let now = Instant::now();

    assert_eq!(controller.next_delay(now).delay, Duration::from_secs(10));
    assert_eq!(controller.next_delay(now).delay, Duration::from_secs(60));
    assert_eq!(controller.next_delay(now).delay, Duration::from_secs(300));
    assert_eq!(
        controller.next_delay(now).delay,
        Duration::from_secs(300),
        "past the end of the sequence the last delay holds"
    );
}

#[tokio::test(start_paused = true)]
async fn exceeding_the_window_cap_layers_the_extra_pause() {
    let mut controller = RestartController::new(policy());
    let now = Instant::now();

    let first = controller.next_delay(now);
    let second = controller.next_delay(now);
    assert!(!first.window_exhausted);
    assert!(!second.window_exhausted);

    // Third restart inside the same window: wait out the window's
    // remainder (a full hour here) plus the extra three-hour pause.
    let third = controller.next_delay(now);
    assert!(third.window_exhausted);
    assert_eq!(third.delay, Duration::from_secs(3600).saturating_add(Duration::from_secs(10_800)));
}

#[tokio::test(start_paused = true)]
async fn restart_count_resets_only_after_a_clean_window() {
    let mut controller = RestartController::new(policy());
    let now = Instant::now();

    controller.next_delay(now);
    controller.next_delay(now);
    assert_eq!(controller.restart_count(now), 2);

    // Still inside the window: the count holds.
    let mid = now.checked_add(Duration::from_secs(1800)).expect("instant");
    assert_eq!(controller.restart_count(mid), 2);

    // A full window with no restart: the count reads zero again.
    let after = now.checked_add(Duration::from_secs(3601)).expect("instant");
    assert_eq!(controller.restart_count(after), 0);

    // And the next restart starts a fresh window at the first backoff.
    let decision = controller.next_delay(after);
    assert_eq!(decision.delay, Duration::from_secs(10));
    assert!(!decision.window_exhausted);
    assert_eq!(controller.restart_count(after), 1);
}

#[tokio::test(start_paused = true)]
async fn count_increases_strictly_within_the_window() {
    let mut controller = RestartController::new(RestartConfig {
        max_per_window: 100,
        ..policy()
    });
    let now = Instant::now();

    let mut previous = 0;
    for _ in 0..5 {
        controller.next_delay(now);
        let count = controller.restart_count(now);
        assert!(count > previous, "count must strictly increase");
        previous = count;
    }
}

#[test]
fn escalating_delay_indexes_and_clamps() {
    let seq = [5u64, 30, 120];
    assert_eq!(escalating_delay(&seq, 0), Duration::from_secs(5));
    assert_eq!(escalating_delay(&seq, 2), Duration::from_secs(120));
    assert_eq!(escalating_delay(&seq, 9), Duration::from_secs(120));
    assert_eq!(escalating_delay(&[], 0), Duration::ZERO);
}

#[test]
fn jitter_only_ever_extends_within_ten_percent() {
    let base = Duration::from_secs(100);
    for _ in 0..50 {
        let jittered = with_jitter(base);
        assert!(jittered >= base);
        assert!(jittered <= Duration::from_secs(110));
    }
}
