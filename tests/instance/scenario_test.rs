//! End-to-end lifecycle scenarios driven through the fake engine with
//! virtual time.

use std::time::Duration;

use straylight::engine::EngineEvent;
use straylight::instance::InstanceState;

use crate::support::{
    enqueue_text, get_status, settle, spawn_actor, start_instance, test_config, FakeEngine,
};

/// QR login races the unreliable `ready` event: the instance still
/// reaches `Active` because the identity poll succeeds first.
#[tokio::test(start_paused = true)]
async fn ready_poll_fallback_activates_without_ready_event() {
    let engine = FakeEngine::new();
    let fixture = spawn_actor("t1", test_config(), &engine);
    start_instance(&fixture.cmd_tx).await;

    engine
        .push_event(EngineEvent::Qr {
            code: "qr-payload".to_owned(),
        })
        .await;
    settle().await;
    let status = get_status(&fixture.cmd_tx).await;
    assert_eq!(status.state, InstanceState::NeedsQr);
    assert_eq!(status.qr_attempt, Some(0));

    engine.push_event(EngineEvent::Authenticated).await;
    settle().await;
    assert_eq!(
        get_status(&fixture.cmd_tx).await.state,
        InstanceState::Syncing
    );

    // The ready event never arrives, but the session answers the
    // identity poll.
    engine.set_identity(Some("5521@host".to_owned()));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        get_status(&fixture.cmd_tx).await.state,
        InstanceState::Active,
        "poll fallback must activate the instance"
    );
}

/// A disconnect pauses everything for at least the minimum cooldown;
/// once the instance recovers, the queued items go out in order.
#[tokio::test(start_paused = true)]
async fn disconnect_cooldown_defers_queued_sends_then_drains_in_order() {
    let engine = FakeEngine::new();
    let fixture = spawn_actor("t1", test_config(), &engine);
    start_instance(&fixture.cmd_tx).await;
    engine.push_event(EngineEvent::Authenticated).await;
    settle().await;

    for body in ["one", "two", "three"] {
        enqueue_text(&fixture.cmd_tx, "chat", body).await.expect("queued");
    }

    engine
        .push_event(EngineEvent::Disconnected { reason: None })
        .await;
    settle().await;
    assert_eq!(
        get_status(&fixture.cmd_tx).await.state,
        InstanceState::Disconnected
    );

    // Cooldown is 5s in the test config; nothing may go out before it.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(
        engine.sent().is_empty(),
        "sends must stay deferred through the cooldown"
    );

    // Cooldown elapses, the instance reconnects and recovers.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    engine.push_event(EngineEvent::Authenticated).await;
    engine.push_event(EngineEvent::Ready).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let bodies: Vec<String> = engine.sent().into_iter().map(|(_, body)| body).collect();
    assert_eq!(
        bodies,
        ["one", "two", "three"],
        "drain resumes in original order"
    );
    assert_eq!(engine.launches(), 2, "one relaunch after the cooldown");
}

/// An item whose TTL expires before the instance activates is dropped at
/// drain time and never reaches the engine.
#[tokio::test(start_paused = true)]
async fn expired_item_is_dropped_never_sent() {
    let mut cfg = test_config();
    cfg.queue.item_ttl_secs = 1;
    let engine = FakeEngine::new();
    let fixture = spawn_actor("t1", cfg, &engine);
    start_instance(&fixture.cmd_tx).await;
    engine.push_event(EngineEvent::Authenticated).await;
    settle().await;

    enqueue_text(&fixture.cmd_tx, "chat", "too-late").await.expect("queued");
    assert_eq!(get_status(&fixture.cmd_tx).await.queue_len, 1);

    // Let the TTL lapse while the instance is still syncing.
    tokio::time::sleep(Duration::from_secs(2)).await;

    engine.push_event(EngineEvent::Ready).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(engine.sent().is_empty(), "expired item must never be sent");
    assert_eq!(
        get_status(&fixture.cmd_tx).await.queue_len,
        0,
        "expired item dropped from the queue"
    );
}

/// Fresh items behind an expired head still go out once it is dropped.
#[tokio::test(start_paused = true)]
async fn expired_head_does_not_block_fresh_items() {
    let mut cfg = test_config();
    cfg.queue.item_ttl_secs = 1;
    let engine = FakeEngine::new();
    let fixture = spawn_actor("t1", cfg.clone(), &engine);
    start_instance(&fixture.cmd_tx).await;
    engine.push_event(EngineEvent::Authenticated).await;
    settle().await;

    enqueue_text(&fixture.cmd_tx, "chat", "stale").await.expect("queued");
    tokio::time::sleep(Duration::from_secs(2)).await;
    enqueue_text(&fixture.cmd_tx, "chat", "fresh").await.expect("queued");

    engine.push_event(EngineEvent::Ready).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let bodies: Vec<String> = engine.sent().into_iter().map(|(_, body)| body).collect();
    assert_eq!(bodies, ["fresh"]);
}
