//! Atomic JSON snapshot persistence.
//!
//! The instance list and the idempotency store are plain JSON files
//! treated as key-value snapshots. Writes go to a temporary file first
//! and are renamed into place, so readers (including external maintenance
//! tooling) never observe a partial write.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Load a snapshot from disk, returning the default value when the file
/// does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_snapshot<T>(path: &Path) -> anyhow::Result<T>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse snapshot at {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(anyhow::anyhow!(
            "failed to read snapshot at {}: {e}",
            path.display()
        )),
    }
}

/// Write a snapshot to disk atomically.
///
/// Writes to `<path>.tmp` first, then renames to the final path. This
/// ensures readers always see a complete file even if the process dies
/// mid-write.
///
/// # Errors
///
/// Returns an error if serialization or file operations fail.
pub async fn write_snapshot<T>(value: &T, path: &Path) -> anyhow::Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(value).context("failed to serialize snapshot")?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to rename into {}", path.display()))?;

    Ok(())
}
