//! Tunnel fleet supervisor daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!   fleet.toml ──▶ config ──▶ Fleet ──────────────┐
//!                               │                  │
//!                               ▼                  ▼
//!                         ConfigStore         Supervisor ──▶ frpc (client 1)
//!                     data/cmd/<id>/frpc.toml      │     ──▶ frpc (client 2)
//!                               ▲                  │
//!                               │                  ▼
//!                      DocumentWatcher ──▶ hot reload via admin endpoint
//! ```
//!
//! The daemon starts every client that has both an executable and a
//! document, reloads running clients whose document changes on disk, and
//! stops all of them on SIGINT/SIGTERM.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use tunnel_fleet::config::{load_or_default, DocumentWatcher};
use tunnel_fleet::lifecycle::{signals, Shutdown};
use tunnel_fleet::observability::{logging, metrics};
use tunnel_fleet::Fleet;

/// Quiet period before a burst of document events is acted on.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "tunnel-fleet")]
#[command(about = "Supervises a fleet of tunnel client processes", long_about = None)]
struct Args {
    /// Engine settings file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_or_default(args.config.as_deref())?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("tunnel-fleet v{} starting", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.paths.data_dir)?;
    config.paths.data_dir = std::fs::canonicalize(&config.paths.data_dir)?;

    tracing::info!(
        data_dir = %config.paths.data_dir.display(),
        lock_timeout_ms = config.store.lock_timeout_ms,
        stop_timeout_ms = config.supervisor.stop_timeout_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let fleet = Arc::new(Fleet::from_config(&config));

    if config.supervisor.autostart {
        let started = fleet.start_all().await?;
        tracing::info!(started, "Autostart complete");
    }

    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(&shutdown);

    // The watcher stops when this binding is dropped.
    let _watcher = if config.observability.watch_documents {
        let (watcher, changes) = DocumentWatcher::new(fleet.store().layout().clone());
        match watcher.run() {
            Ok(handle) => {
                tokio::spawn(reload_changed(Arc::clone(&fleet), changes, shutdown.clone()));
                Some(handle)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to watch documents; hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    shutdown.requested().await;

    tracing::info!("Stopping client processes");
    if let Err(e) = fleet.stop_all().await {
        tracing::error!(error = %e, "Some processes failed to stop cleanly");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Hot-reload running clients whose documents changed, coalescing bursts.
async fn reload_changed(fleet: Arc<Fleet>, mut changes: mpsc::UnboundedReceiver<String>, shutdown: Shutdown) {
    loop {
        let first = tokio::select! {
            changed = changes.recv() => match changed {
                Some(client_id) => client_id,
                None => return,
            },
            _ = shutdown.requested() => return,
        };

        let mut pending = BTreeSet::from([first]);
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while let Ok(client_id) = changes.try_recv() {
            pending.insert(client_id);
        }

        for client_id in pending {
            match fleet.reload_if_running(&client_id).await {
                Ok(true) => tracing::info!(client_id = %client_id, "Reloaded after document change"),
                Ok(false) => tracing::debug!(client_id = %client_id, "Document changed, client not running"),
                Err(e) => tracing::warn!(client_id = %client_id, error = %e, "Hot reload failed"),
            }
        }
    }
}
