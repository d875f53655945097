//! Outbound send path: bounded queue, rate limiter, idempotency store.
//!
//! Backpressure is bounded queueing plus TTL/drop — the queue absorbs
//! sends while an instance is below `Active`, and an item that outlives
//! its deadline is dropped rather than sent late.

pub mod idempotency;
pub mod limiter;
pub mod queue;

use serde::{Deserialize, Serialize};

/// Payload of one outbound send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendPayload {
    /// Plain text message.
    Text {
        /// Message body.
        body: String,
    },
    /// Poll with a question and options.
    Poll {
        /// Poll question.
        question: String,
        /// Poll options, in display order.
        options: Vec<String>,
    },
}
