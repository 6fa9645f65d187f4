//! Dispatcher process configuration.
//!
//! Only the process shell is configured here. Routing and allowlists live in
//! the snapshot file, which can be reloaded without a restart.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use sni_passthrough::proxy::DEFAULT_MAX_CONNECTIONS;

/// Dispatcher configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the passthrough listener binds to.
    pub listen_addr: SocketAddr,

    /// JSON snapshot with backends and server allowlists.
    pub snapshot_file: PathBuf,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = std::env::var("PASSTHROUGH_LISTEN_ADDR")
            .unwrap_or_else(|_| "[::]:443".to_string())
            .parse()
            .context("PASSTHROUGH_LISTEN_ADDR must be a socket address (example: [::]:443).")?;

        let snapshot_file = std::env::var("PASSTHROUGH_SNAPSHOT_FILE")
            .map(PathBuf::from)
            .context("Missing snapshot file. Set PASSTHROUGH_SNAPSHOT_FILE.")?;

        let max_connections: usize = std::env::var("PASSTHROUGH_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PASSTHROUGH_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level =
            std::env::var("PASSTHROUGH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            snapshot_file,
            max_connections,
            log_level,
        })
    }
}
