//! Persisted idempotency store: the sole at-most-once mechanism.
//!
//! Maps a caller-supplied key to a cached send result with an expiry.
//! A request presenting a known, unexpired key gets the cached result
//! back without re-issuing the send — across retried API calls and
//! across process restarts, since the store is persisted to disk and
//! reloaded at startup. Records expire by TTL and are never deleted
//! early.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store;

/// Cached result of an accepted send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedReceipt {
    /// Queue item identifier assigned to the send.
    pub item_id: Uuid,
    /// When the item was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// One persisted record: result plus expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    result: QueuedReceipt,
    expires_at: DateTime<Utc>,
}

/// Persisted key → result store with TTL expiry.
pub struct IdempotencyStore {
    path: PathBuf,
    ttl_secs: u64,
    records: Mutex<HashMap<String, StoredRecord>>,
}

impl IdempotencyStore {
    /// Load the store from disk, dropping records that expired while the
    /// process was down. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: PathBuf, ttl_secs: u64) -> anyhow::Result<Self> {
        let mut records: HashMap<String, StoredRecord> =
            store::load_snapshot(&path).context("failed to load idempotency store")?;

        let now = Utc::now();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        if before > records.len() {
            debug!(
                expired = before.saturating_sub(records.len()),
                "dropped expired idempotency records at load"
            );
        }
        if !records.is_empty() {
            info!(count = records.len(), "idempotency store loaded");
        }

        Ok(Self {
            path,
            ttl_secs,
            records: Mutex::new(records),
        })
    }

    /// Look up an unexpired record for `key`.
    pub fn lookup(&self, key: &str) -> Option<QueuedReceipt> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records
            .get(key)
            .filter(|record| record.expires_at > Utc::now())
            .map(|record| record.result.clone())
    }

    /// Record a result for `key` and persist the snapshot.
    ///
    /// Must be called before the underlying send is dispatched, so a
    /// crash between record and dispatch errs on the side of not
    /// re-sending. Expired records are pruned on the way out; unexpired
    /// ones are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn record(&self, key: &str, result: QueuedReceipt) -> anyhow::Result<()> {
        let expires_at = Utc::now()
            .checked_add_signed(Duration::seconds(
                i64::try_from(self.ttl_secs).unwrap_or(i64::MAX),
            ))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let snapshot = {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Utc::now();
            records.retain(|_, record| record.expires_at > now);
            records.insert(key.to_owned(), StoredRecord { result, expires_at });
            records.clone()
        };

        store::write_snapshot(&snapshot, &self.path)
            .await
            .context("failed to persist idempotency store")
    }

    /// Number of records currently held (including expired-but-unpruned).
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
