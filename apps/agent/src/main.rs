//! # Tillsync Agent
//!
//! Headless process that keeps a till's Local Store reconciled with the
//! remote authority.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Parse CLI arguments, initialize tracing                             │
//! │  2. Load sync.toml (defaults → file → environment)                      │
//! │  3. Open the Local Store and run migrations                             │
//! │  4. Return items stuck in `processing` to `pending`                     │
//! │  5. Wire monitor, authority, queue, resolver into the orchestrator      │
//! │  6. Either run one sync and print it, or spawn the trigger loop and     │
//! │     wait for Ctrl+C / SIGTERM                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tillsync_db::{Database, DbConfig};
use tillsync_sync::{
    ChangeQueue, ConflictResolver, HttpAuthority, LinkProbe, NetworkMonitor, OrchestratorSettings,
    SyncConfig, SyncFacade, SyncOrchestrator, TracingEmitter, UdpRouteProbe,
};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "tillsync-agent", version, about = "Offline-first sync agent for a till")]
struct Args {
    /// Path to sync.toml. Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the SQLite Local Store. Defaults to the platform data directory.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Run a single sync, print its record as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let config = SyncConfig::load(args.config)?;
    info!(
        device_id = %config.device_id(),
        authority = %config.authority.base_url,
        interval_secs = config.sync.interval_secs,
        "Configuration loaded"
    );

    let db_path = args
        .database
        .or_else(SyncConfig::default_database_path)
        .ok_or("No database path given and no data directory available")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(DbConfig::new(db_path.clone())).await?;
    info!(path = %db_path.display(), "Local Store opened");

    let queue = ChangeQueue::new(&db, config.sync.batch_size);
    let recovered = queue.recover_stale().await?;
    if recovered > 0 {
        warn!(recovered, "Requeued items interrupted by the last shutdown");
    }

    let monitor = Arc::new(NetworkMonitor::from_config(&config)?);
    let watcher = monitor.spawn_link_watcher(Arc::new(UdpRouteProbe::default()), config.link_poll_interval());

    let authority = Arc::new(HttpAuthority::new(&config.authority)?);
    let resolver = ConflictResolver::new(db.clone(), config.conflict_policy());
    let orchestrator = SyncOrchestrator::new(
        db,
        authority,
        Arc::clone(&monitor),
        queue,
        resolver,
        OrchestratorSettings::from_config(&config),
    );
    let facade = SyncFacade::new(orchestrator.clone());

    if args.once {
        // The watcher's first sample lands on its own task; take one here so
        // the run sees the current link state.
        monitor.report_link(UdpRouteProbe::default().link_up().await);
        let run = facade.force_sync().await?;
        watcher.abort();
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    let bridge = facade.spawn_event_bridge(Arc::new(TracingEmitter));
    let handle = orchestrator.spawn();
    info!("Sync agent running");

    shutdown_signal().await;

    handle.shutdown().await;
    bridge.abort();
    watcher.abort();
    info!("Sync agent stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
