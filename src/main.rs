#![allow(missing_docs)]

//! Straylight hub binary.
//!
//! `start` runs the hub: loads the persisted instance list, restores
//! instances sequentially, and serves until SIGINT. `status` renders the
//! last health snapshot. `add`/`remove` edit the persisted instance list
//! while the hub is stopped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use straylight::config::{HubConfig, PathsConfig};
use straylight::engine::bridge::{BridgeEngine, DEFAULT_BRIDGE_PORT};
use straylight::engine::hooks::NoHooks;
use straylight::health;
use straylight::instance::{InstanceDescriptor, WebhookTarget};
use straylight::logging;
use straylight::outbound::idempotency::IdempotencyStore;
use straylight::registry::InstanceRegistry;
use straylight::restore::SysinfoProbe;
use straylight::store;
use straylight::webhook::WebhookDispatcher;

/// How long to wait for actors to wind down at shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(45);

#[derive(Parser)]
#[command(name = "straylight", version, about = "Multi-tenant chat-session hub")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub.
    Start,
    /// Print the last health snapshot.
    Status,
    /// Add an instance to the persisted list (hub must be stopped).
    Add {
        /// Unique instance id.
        id: String,
        /// Display name; defaults to the id.
        #[arg(long)]
        name: Option<String>,
        /// Webhook sink URL.
        #[arg(long)]
        webhook_url: Option<String>,
        /// Webhook signing secret; required with --webhook-url.
        #[arg(long)]
        webhook_secret: Option<String>,
    },
    /// Remove an instance from the persisted list (hub must be stopped).
    Remove {
        /// Instance id to remove.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = HubConfig::load().context("failed to load configuration")?;
    let data_dir = config.paths.resolve_data_dir()?;

    match cli.command {
        Command::Start => start(config, data_dir).await,
        Command::Status => {
            logging::init_cli();
            status(&data_dir)
        }
        Command::Add {
            id,
            name,
            webhook_url,
            webhook_secret,
        } => {
            logging::init_cli();
            add_instance(&data_dir, id, name, webhook_url, webhook_secret).await
        }
        Command::Remove { id } => {
            logging::init_cli();
            remove_instance(&data_dir, &id).await
        }
    }
}

async fn start(config: HubConfig, data_dir: std::path::PathBuf) -> Result<()> {
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let _logging_guard = logging::init_hub(&PathsConfig::logs_dir(&data_dir))?;

    info!(version = env!("CARGO_PKG_VERSION"), "straylight starting");
    let start_time = Instant::now();
    let config = Arc::new(config);

    // Cross-cutting sinks and stores.
    let dispatcher = WebhookDispatcher::spawn(config.webhook.clone());
    let idempotency = Arc::new(
        IdempotencyStore::load(
            PathsConfig::idempotency_file(&data_dir),
            config.idempotency.ttl_secs,
        )
        .context("failed to load idempotency store")?,
    );

    let engine = Arc::new(match &config.engine.bridge_url {
        Some(url) => BridgeEngine::new(url.clone()),
        None => BridgeEngine::with_port(DEFAULT_BRIDGE_PORT),
    });
    info!(bridge = engine.base_url(), "automation bridge configured");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(InstanceRegistry::new(
        Arc::clone(&config),
        engine,
        Arc::new(NoHooks),
        dispatcher.sender(),
        idempotency,
        PathsConfig::instances_file(&data_dir),
        shutdown_rx.clone(),
    ));

    // Reload the persisted instance list and restore sequentially.
    let descriptors = InstanceRegistry::load_descriptors(&PathsConfig::instances_file(&data_dir))
        .context("failed to load instance list")?;
    info!(count = descriptors.len(), "persisted instances loaded");
    for descriptor in descriptors {
        if let Err(e) = registry.register(descriptor).await {
            warn!(error = %e, "failed to register persisted instance");
        }
    }

    let probe = SysinfoProbe::new();
    let report = registry.restore_all(&probe).await;
    for failure in &report.failed {
        warn!(
            instance = %failure.instance_id,
            reason = %failure.reason,
            "instance failed to restore"
        );
    }
    info!(
        started = report.started.len(),
        failed = report.failed.len(),
        "restore finished"
    );

    let health_task = tokio::spawn(health::run_health_loop(
        Arc::clone(&registry),
        PathsConfig::health_file(&data_dir),
        config.health.check_interval_secs,
        start_time,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    registry.join_all(SHUTDOWN_WAIT).await;
    if let Err(e) = health_task.await {
        warn!(error = %e, "health loop task failed");
    }
    dispatcher.shutdown().await;

    info!("straylight stopped");
    Ok(())
}

fn status(data_dir: &std::path::Path) -> Result<()> {
    let report = health::read_health_file(&PathsConfig::health_file(data_dir))?;
    println!(
        "status: {} (uptime {}s, heartbeat {})",
        report.status, report.uptime_secs, report.last_heartbeat
    );
    println!(
        "instances: {} total, {} active, {} errored",
        report.instance_count, report.active_count, report.error_count
    );
    for instance in &report.instances {
        let error = instance
            .last_error
            .as_ref()
            .map(|e| format!(" — {}", e.message))
            .unwrap_or_default();
        println!(
            "  {:<24} {:<12} queue={} restarts={}{}",
            instance.id,
            instance.state.label(),
            instance.queue_len,
            instance.restart_count,
            error
        );
    }
    Ok(())
}

async fn add_instance(
    data_dir: &std::path::Path,
    id: String,
    name: Option<String>,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
) -> Result<()> {
    let webhook = match (webhook_url, webhook_secret) {
        (Some(url), Some(secret)) => Some(WebhookTarget { url, secret }),
        (Some(_), None) => anyhow::bail!("--webhook-url requires --webhook-secret"),
        _ => None,
    };

    let path = PathsConfig::instances_file(data_dir);
    let mut descriptors: Vec<InstanceDescriptor> = store::load_snapshot(&path)?;
    if descriptors.iter().any(|d| d.id == id) {
        anyhow::bail!("instance '{id}' already exists");
    }

    descriptors.push(InstanceDescriptor {
        display_name: name.unwrap_or_else(|| id.clone()),
        id: id.clone(),
        webhook,
        created_at: chrono::Utc::now(),
    });
    store::write_snapshot(&descriptors, &path).await?;
    println!("added instance '{id}' ({} total)", descriptors.len());
    Ok(())
}

async fn remove_instance(data_dir: &std::path::Path, id: &str) -> Result<()> {
    let path = PathsConfig::instances_file(data_dir);
    let mut descriptors: Vec<InstanceDescriptor> = store::load_snapshot(&path)?;
    let before = descriptors.len();
    descriptors.retain(|d| d.id != id);
    if descriptors.len() == before {
        anyhow::bail!("no instance '{id}' in the persisted list");
    }
    store::write_snapshot(&descriptors, &path).await?;
    println!("removed instance '{id}' ({} remaining)", descriptors.len());
    Ok(())
}
