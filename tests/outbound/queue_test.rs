//! Tests for `src/outbound/queue.rs` — bounded FIFO with per-item TTL.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use straylight::outbound::queue::{OutboundQueue, Pop, QueueError, QueuedSend};
use straylight::outbound::SendPayload;

fn item(chat: &str, body: &str, deadline: Instant) -> QueuedSend {
    QueuedSend {
        id: Uuid::new_v4(),
        chat_id: chat.to_owned(),
        payload: SendPayload::Text {
            body: body.to_owned(),
        },
        enqueued_at: chrono::Utc::now(),
        deadline,
    }
}

fn far(now: Instant) -> Instant {
    now.checked_add(Duration::from_secs(3600)).expect("instant")
}

#[tokio::test(start_paused = true)]
async fn enqueue_rejected_at_capacity() {
    let now = Instant::now();
    let mut queue = OutboundQueue::new(2);

    queue.push(item("a", "1", far(now))).expect("first fits");
    queue.push(item("a", "2", far(now))).expect("second fits");

    let err = queue
        .push(item("a", "3", far(now)))
        .expect_err("third must be rejected");
    assert!(matches!(err, QueueError::Full { max: 2 }));
    assert_eq!(queue.len(), 2, "rejected item must not be enqueued");
}

#[tokio::test(start_paused = true)]
async fn pop_preserves_fifo_order() {
    let now = Instant::now();
    let mut queue = OutboundQueue::new(10);
    for body in ["1", "2", "3"] {
        queue.push(item("a", body, far(now))).expect("fits");
    }

    for expected in ["1", "2", "3"] {
        match queue.pop_next(now) {
            Pop::Item(sent) => match sent.payload {
                SendPayload::Text { body } => assert_eq!(body, expected),
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("expected item, got {other:?}"),
        }
    }
    assert!(matches!(queue.pop_next(now), Pop::Empty));
}

#[tokio::test(start_paused = true)]
async fn expired_head_is_classified_not_returned_live() {
    let now = Instant::now();
    let mut queue = OutboundQueue::new(10);
    let soon = now.checked_add(Duration::from_secs(1)).expect("instant");
    queue.push(item("a", "stale", soon)).expect("fits");
    queue.push(item("a", "fresh", far(now))).expect("fits");

    tokio::time::advance(Duration::from_secs(5)).await;
    let later = Instant::now();

    assert!(matches!(queue.pop_next(later), Pop::Expired(_)));
    match queue.pop_next(later) {
        Pop::Item(sent) => match sent.payload {
            SendPayload::Text { body } => assert_eq!(body, "fresh"),
            other => panic!("unexpected payload {other:?}"),
        },
        other => panic!("expected live item, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn push_front_restores_the_head() {
    let now = Instant::now();
    let mut queue = OutboundQueue::new(2);
    queue.push(item("a", "1", far(now))).expect("fits");
    queue.push(item("a", "2", far(now))).expect("fits");

    let popped = match queue.pop_next(now) {
        Pop::Item(sent) => sent,
        other => panic!("expected item, got {other:?}"),
    };
    queue.push_front(popped);

    assert_eq!(queue.len(), 2);
    match queue.pop_next(now) {
        Pop::Item(sent) => match sent.payload {
            SendPayload::Text { body } => assert_eq!(body, "1", "deferred item stays at head"),
            other => panic!("unexpected payload {other:?}"),
        },
        other => panic!("expected item, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn clear_reports_discarded_count() {
    let now = Instant::now();
    let mut queue = OutboundQueue::new(10);
    for body in ["1", "2", "3"] {
        queue.push(item("a", body, far(now))).expect("fits");
    }

    assert_eq!(queue.clear(), 3);
    assert!(queue.is_empty());
}
