//! Bounded FIFO outbound queue with per-item TTL.
//!
//! Enqueue is rejected at capacity — the caller retries or accepts loss.
//! An item whose deadline has passed when it reaches the head is dropped,
//! never sent. Ordering is strictly FIFO apart from rate-limit deferrals,
//! which put the popped item straight back at the head.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::SendPayload;

/// Errors from the outbound queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is at its configured hard cap.
    #[error("outbound queue full ({max} items)")]
    Full {
        /// Configured maximum length.
        max: usize,
    },
}

/// One queued outbound send.
#[derive(Debug, Clone)]
pub struct QueuedSend {
    /// Queue-assigned item identifier.
    pub id: Uuid,
    /// Destination chat.
    pub chat_id: String,
    /// What to send.
    pub payload: SendPayload,
    /// Wall-clock enqueue time (observability only).
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic deadline after which the item is dropped.
    pub deadline: Instant,
}

/// Result of asking the queue for its next item.
#[derive(Debug)]
pub enum Pop {
    /// A live item, removed from the queue.
    Item(QueuedSend),
    /// The head item's deadline had passed; it was removed and must not
    /// be sent.
    Expired(QueuedSend),
    /// The queue is empty.
    Empty,
}

/// Bounded FIFO queue owned by one instance actor.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<QueuedSend>,
    max_len: usize,
}

impl OutboundQueue {
    /// Create an empty queue with the given hard cap.
    pub fn new(max_len: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_len,
        }
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] when the queue is at capacity; the
    /// item is not enqueued.
    pub fn push(&mut self, item: QueuedSend) -> Result<(), QueueError> {
        if self.items.len() >= self.max_len {
            return Err(QueueError::Full { max: self.max_len });
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Put a just-popped item back at the head (rate-limit deferral or
    /// transient send failure).
    ///
    /// Always succeeds: the slot was freed by the pop that produced the
    /// item, so the cap cannot be exceeded.
    pub fn push_front(&mut self, item: QueuedSend) {
        self.items.push_front(item);
    }

    /// Remove and return the head item, classifying it by TTL.
    pub fn pop_next(&mut self, now: Instant) -> Pop {
        match self.items.pop_front() {
            None => Pop::Empty,
            Some(item) if item.deadline <= now => Pop::Expired(item),
            Some(item) => Pop::Item(item),
        }
    }

    /// Drop every queued item (forced delete path).
    ///
    /// Returns how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
