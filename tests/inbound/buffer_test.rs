//! Tests for `src/inbound.rs` — bounded drop-oldest buffering and batch
//! flush behavior.

use straylight::engine::{EngineEvent, InboundMessage};
use straylight::inbound::InboundBuffer;

fn message(body: &str) -> EngineEvent {
    EngineEvent::Message(InboundMessage {
        chat_id: "chat".to_owned(),
        message_id: None,
        body: body.to_owned(),
        from_me: false,
        timestamp: None,
    })
}

fn body_of(event: &EngineEvent) -> &str {
    match event {
        EngineEvent::Message(msg) => &msg.body,
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn overflow_drops_the_oldest_entry() {
    let mut buffer = InboundBuffer::new(2, 10);

    assert!(buffer.push(message("1")).is_none());
    assert!(buffer.push(message("2")).is_none());

    let dropped = buffer.push(message("3")).expect("overflow drops one");
    assert_eq!(body_of(&dropped.event), "1", "the oldest entry goes first");

    let remaining: Vec<String> = buffer
        .drain_all()
        .into_iter()
        .map(|e| body_of(&e.event).to_owned())
        .collect();
    assert_eq!(remaining, ["2", "3"]);
}

#[test]
fn batch_threshold_is_reported() {
    let mut buffer = InboundBuffer::new(10, 3);
    buffer.push(message("1"));
    buffer.push(message("2"));
    assert!(!buffer.batch_ready());

    buffer.push(message("3"));
    assert!(buffer.batch_ready());
}

#[test]
fn drain_batch_takes_at_most_one_batch_oldest_first() {
    let mut buffer = InboundBuffer::new(10, 2);
    for n in ["1", "2", "3"] {
        buffer.push(message(n));
    }

    let batch: Vec<String> = buffer
        .drain_batch()
        .into_iter()
        .map(|e| body_of(&e.event).to_owned())
        .collect();
    assert_eq!(batch, ["1", "2"]);
    assert_eq!(buffer.len(), 1, "remainder stays buffered");
}

#[test]
fn drain_on_empty_buffer_is_empty() {
    let mut buffer = InboundBuffer::new(10, 2);
    assert!(buffer.drain_batch().is_empty());
    assert!(buffer.drain_all().is_empty());
    assert!(buffer.is_empty());
}
