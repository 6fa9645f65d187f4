//! SNI passthrough dispatcher
//!
//! Routes raw TLS connections by the server name in their ClientHello
//! without terminating TLS.
//!
//! This service:
//! - Loads backends and server allowlists from a JSON snapshot
//! - Accepts TCP connections on one listener
//! - Sniffs the ClientHello server name and picks a backend
//! - Enforces per-server source CIDR allowlists
//! - Optionally injects PROXY protocol v1 headers
//! - Reloads the snapshot on SIGHUP

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use sni_passthrough::{Listener, ListenerConfig, Snapshot, SnapshotStore};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PASSTHROUGH_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SNI passthrough dispatcher");
    info!(
        listen_addr = %config.listen_addr,
        snapshot_file = %config.snapshot_file.display(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let snapshots = Arc::new(SnapshotStore::new(Snapshot::from_file(&config.snapshot_file)?));

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = match Listener::bind(listener_config, Arc::clone(&snapshots)).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    spawn_reload_on_hangup(Arc::clone(&snapshots), config.snapshot_file.clone())?;

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = &result {
                error!(error = %e, "Listener stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    Ok(())
}

/// Swap in a freshly loaded snapshot whenever the process receives SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(snapshots: Arc<SnapshotStore>, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!(path = %path.display(), "Reloading snapshot");
            if let Err(e) = snapshots.reload_from(&path) {
                let detail = format!("{:#}", e);
                warn!(error = %detail, "Snapshot reload failed, keeping current snapshot");
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_snapshots: Arc<SnapshotStore>, _path: PathBuf) -> Result<()> {
    Ok(())
}
