//! Configuration loading and management.
//!
//! Loads hub configuration from `./straylight.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level hub configuration loaded from TOML.
///
/// Every tunable named in the external configuration surface has a home
/// here and a default, so a missing or partial file always yields a
/// runnable hub.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
    /// Outbound queue sizing and drain pacing.
    pub queue: QueueConfig,
    /// Per-instance send rate limits.
    pub rate: RateConfig,
    /// Inbound event buffering while an instance is capacity-constrained.
    pub inbound: InboundConfig,
    /// Restart backoff sequence and sliding restart window.
    pub restart: RestartConfig,
    /// Watchdog thresholds and poll fallbacks.
    pub watchdog: WatchdogConfig,
    /// QR login cycle policy.
    pub qr: QrConfig,
    /// Disconnect cooldowns.
    pub disconnect: DisconnectConfig,
    /// Sequential restore scheduler tuning.
    pub restore: RestoreConfig,
    /// Health check interval and zombie threshold.
    pub health: HealthConfig,
    /// Webhook delivery tuning.
    pub webhook: WebhookConfig,
    /// Idempotency record expiry.
    pub idempotency: IdempotencyConfig,
    /// Hard timeouts on automation engine operations.
    pub engine: EngineConfig,
}

impl HubConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./straylight.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: HubConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(HubConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("STRAYLIGHT_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("straylight.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("STRAYLIGHT_DATA_DIR") {
            self.paths.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("STRAYLIGHT_WEBHOOK_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.webhook.timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_WEBHOOK_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("STRAYLIGHT_RESTORE_CONCURRENCY") {
            match v.parse() {
                Ok(n) => self.restore.concurrency = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_RESTORE_CONCURRENCY",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Filesystem paths for persisted hub state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root data directory. Defaults to `~/.straylight`.
    pub data_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Resolve the root data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home
    /// directory cannot be determined.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(base.home_dir().join(".straylight"))
    }

    /// Path of the persisted instance list.
    pub fn instances_file(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("instances.json")
    }

    /// Path of the persisted idempotency store.
    pub fn idempotency_file(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("idempotency.json")
    }

    /// Path of the hub health snapshot.
    pub fn health_file(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("health.json")
    }

    /// Directory for rotating JSON log files.
    pub fn logs_dir(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("logs")
    }
}

// ── Outbound queue ──────────────────────────────────────────────

/// Outbound queue sizing and drain pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on queued outbound items per instance.
    pub max_len: usize,
    /// Time-to-live for a queued item; expired items are dropped at drain.
    pub item_ttl_secs: u64,
    /// Minimum spacing between successive sends.
    pub drain_spacing_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_len: 100,
            item_ttl_secs: 3600,
            drain_spacing_ms: 1500,
        }
    }
}

impl QueueConfig {
    /// Item TTL as a [`Duration`].
    pub fn item_ttl(&self) -> Duration {
        Duration::from_secs(self.item_ttl_secs)
    }

    /// Drain spacing as a [`Duration`].
    pub fn drain_spacing(&self) -> Duration {
        Duration::from_millis(self.drain_spacing_ms)
    }
}

// ── Rate limits ─────────────────────────────────────────────────

/// Per-instance send rate limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Maximum sends per minute.
    pub sends_per_minute: u32,
    /// Maximum sends per hour.
    pub sends_per_hour: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            sends_per_minute: 20,
            sends_per_hour: 300,
        }
    }
}

// ── Inbound buffer ──────────────────────────────────────────────

/// Inbound event buffering while an instance is capacity-constrained.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Maximum buffered entries; oldest entries are dropped on overflow.
    pub max_len: usize,
    /// Flush as soon as this many entries are buffered.
    pub batch_size: usize,
    /// Flush at least this often while entries are buffered.
    pub flush_interval_secs: u64,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            max_len: 500,
            batch_size: 25,
            flush_interval_secs: 5,
        }
    }
}

impl InboundConfig {
    /// Flush interval as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

// ── Restart policy ──────────────────────────────────────────────

/// Restart backoff sequence and sliding restart window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Escalating restart delays in seconds, indexed by backoff position.
    pub backoff_secs: Vec<u64>,
    /// Sliding window size for restart counting.
    pub window_minutes: u64,
    /// Maximum restarts tolerated inside one window.
    pub max_per_window: u32,
    /// Extra pause layered on top once the window cap is exceeded.
    pub extra_pause_hours: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            backoff_secs: vec![10, 60, 300],
            window_minutes: 60,
            max_per_window: 5,
            extra_pause_hours: 3,
        }
    }
}

// ── Watchdogs ───────────────────────────────────────────────────

/// Watchdog thresholds and poll fallbacks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Restart an instance stuck in connecting/QR beyond this threshold.
    pub connecting_timeout_secs: u64,
    /// Connecting-watchdog restarts tolerated before the instance errors out.
    pub connecting_max_restarts: u32,
    /// Ready-watchdog threshold while syncing.
    pub ready_timeout_secs: u64,
    /// Cooldown after a ready timeout before the next launch attempt.
    pub ready_retry_cooldown_secs: u64,
    /// Interval for the ready-poll fallback while syncing.
    pub ready_poll_interval_secs: u64,
    /// Whether the message-fallback poll runs while active.
    pub message_poll_enabled: bool,
    /// Interval for the message-fallback poll.
    pub message_poll_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            connecting_timeout_secs: 180,
            connecting_max_restarts: 5,
            ready_timeout_secs: 120,
            ready_retry_cooldown_secs: 300,
            ready_poll_interval_secs: 15,
            message_poll_enabled: true,
            message_poll_interval_secs: 60,
        }
    }
}

// ── QR cycle ────────────────────────────────────────────────────

/// QR login cycle policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    /// Trigger a recovery re-launch once needs-QR persists this long.
    pub ttl_secs: u64,
    /// A QR with no refresh for this long is flagged stale.
    pub stale_after_secs: u64,
    /// Maximum recovery re-launches before the instance errors out.
    pub max_recovery_attempts: u32,
    /// Escalating delays between recovery attempts, in seconds.
    pub recovery_backoff_secs: Vec<u64>,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            stale_after_secs: 90,
            max_recovery_attempts: 3,
            recovery_backoff_secs: vec![30, 120, 600],
        }
    }
}

// ── Disconnect cooldowns ────────────────────────────────────────

/// Disconnect cooldowns.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisconnectConfig {
    /// Minimum cooldown after any disconnect, regardless of cause.
    pub cooldown_secs: u64,
    /// Extended cooldown when the disconnect reason signals a remote
    /// restriction or ban.
    pub restricted_cooldown_secs: u64,
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            restricted_cooldown_secs: 21_600,
        }
    }
}

// ── Restore scheduler ───────────────────────────────────────────

/// Sequential restore scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// How many instances may be restoring at once.
    pub concurrency: usize,
    /// Cooldown between successive restore starts.
    pub cooldown_secs: u64,
    /// Minimum free host memory required before starting a restore.
    pub min_free_memory_mb: u64,
    /// Memory-gate retries per instance before it is reported failed.
    pub max_attempts: u32,
    /// Delays between memory-gate retries, in seconds.
    pub retry_backoff_secs: Vec<u64>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            cooldown_secs: 15,
            min_free_memory_mb: 1024,
            max_attempts: 5,
            retry_backoff_secs: vec![30, 60, 120],
        }
    }
}

// ── Health checks ───────────────────────────────────────────────

/// Health check interval and zombie threshold.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health ticks.
    pub check_interval_secs: u64,
    /// An active instance with no observed activity for this long is
    /// flagged as a zombie (diagnostic only, never auto-restarted).
    pub zombie_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            zombie_after_secs: 86_400,
        }
    }
}

// ── Webhooks ────────────────────────────────────────────────────

/// Webhook delivery tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// HTTP request timeout per delivery attempt.
    pub timeout_secs: u64,
    /// Delivery attempts per event before it is dropped.
    pub max_attempts: u32,
    /// Delay between delivery attempts.
    pub retry_delay_ms: u64,
    /// Dispatch channel capacity; events beyond it are dropped with a warning.
    pub channel_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_attempts: 3,
            retry_delay_ms: 2000,
            channel_capacity: 256,
        }
    }
}

// ── Idempotency ─────────────────────────────────────────────────

/// Idempotency record expiry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Record TTL; a record is never deleted before it expires.
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

// ── Engine timeouts ─────────────────────────────────────────────

/// Hard timeouts on automation engine operations.
///
/// Every engine call that can block (launch, destroy, chat lookup, send)
/// is wrapped in one of these; a timeout always resolves to a structured
/// failure, never indefinite blocking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the automation sidecar. Defaults to the local bridge
    /// port when unset.
    pub bridge_url: Option<String>,
    /// Session launch timeout.
    pub launch_timeout_secs: u64,
    /// Graceful session destroy timeout.
    pub destroy_timeout_secs: u64,
    /// Send operation timeout.
    pub send_timeout_secs: u64,
    /// Chat/identity lookup timeout.
    pub lookup_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            launch_timeout_secs: 120,
            destroy_timeout_secs: 30,
            send_timeout_secs: 45,
            lookup_timeout_secs: 20,
        }
    }
}

impl EngineConfig {
    /// Launch timeout as a [`Duration`].
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    /// Destroy timeout as a [`Duration`].
    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Lookup timeout as a [`Duration`].
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}
