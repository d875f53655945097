//! Bounded inbound event buffer with batch flush.
//!
//! While an instance is capacity-constrained (syncing, waiting on QR),
//! inbound automation events are buffered here instead of being processed
//! immediately. The buffer is bounded; on overflow the **oldest** entry
//! is dropped to make room. A flush moves a batch back into normal event
//! processing, triggered by the actor on a fixed interval or as soon as
//! the batch threshold is reached, whichever comes first.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::engine::EngineEvent;

/// One buffered inbound event.
#[derive(Debug, Clone)]
pub struct InboundEntry {
    /// The buffered event.
    pub event: EngineEvent,
    /// When it was received.
    pub received_at: DateTime<Utc>,
}

/// Bounded drop-oldest buffer owned by one instance actor.
#[derive(Debug)]
pub struct InboundBuffer {
    entries: VecDeque<InboundEntry>,
    max_len: usize,
    batch_size: usize,
}

impl InboundBuffer {
    /// Create an empty buffer with the given bounds.
    pub fn new(max_len: usize, batch_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_len,
            batch_size,
        }
    }

    /// Buffer an event, dropping the oldest entry on overflow.
    ///
    /// Returns the dropped entry, if the buffer was full.
    pub fn push(&mut self, event: EngineEvent) -> Option<InboundEntry> {
        let dropped = if self.entries.len() >= self.max_len {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(InboundEntry {
            event,
            received_at: Utc::now(),
        });
        dropped
    }

    /// Whether the batch threshold has been reached.
    pub fn batch_ready(&self) -> bool {
        self.entries.len() >= self.batch_size
    }

    /// Remove and return up to one batch of entries, oldest first.
    pub fn drain_batch(&mut self) -> Vec<InboundEntry> {
        let take = self.entries.len().min(self.batch_size);
        self.entries.drain(..take).collect()
    }

    /// Remove and return everything, oldest first.
    pub fn drain_all(&mut self) -> Vec<InboundEntry> {
        self.entries.drain(..).collect()
    }

    /// Current buffer depth.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
