//! Configuration snapshots.
//!
//! A [`Snapshot`] bundles the passthrough routing table with the virtual
//! server configuration that carries the allowlists. Sessions read a
//! snapshot without locking; a reload builds a complete new snapshot and
//! swaps it in with a single pointer store, so a session never sees a half
//! applied update and connections already in flight keep the snapshot they
//! started with.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::proxy::{parse_cidr, AllowlistError, TcpProxy};

/// Snapshot validation errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A whitelist entry does not parse.
    #[error(transparent)]
    InvalidCidr(#[from] AllowlistError),

    /// A backend has port 0.
    #[error("backend {hostname:?} ({address}) has invalid port 0")]
    InvalidPort { hostname: String, address: String },
}

/// Per-location allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whitelist {
    #[serde(default)]
    pub cidr: Vec<String>,
}

/// A location inside a virtual server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub whitelist: Whitelist,
}

/// A virtual server entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    /// Whether TLS passthrough is enabled for this server.
    #[serde(default)]
    pub ssl_passthrough: bool,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// Virtual server configuration consulted for allowlists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub servers: Vec<Server>,
}

/// Everything one session needs, frozen at accept time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub passthrough: TcpProxy,
    #[serde(flatten)]
    pub configuration: Configuration,
}

impl Snapshot {
    pub fn new(passthrough: TcpProxy, configuration: Configuration) -> Self {
        Self {
            passthrough,
            configuration,
        }
    }

    /// Parse and validate a JSON snapshot.
    pub fn from_json(data: &str) -> Result<Self> {
        let snapshot: Snapshot =
            serde_json::from_str(data).context("Failed to parse snapshot JSON")?;
        snapshot.validate().context("Invalid snapshot")?;
        Ok(snapshot)
    }

    /// Load and validate a JSON snapshot from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot file {}", path.display()))?;
        let snapshot = Self::from_json(&data)
            .with_context(|| format!("Failed to load snapshot file {}", path.display()))?;

        info!(
            path = %path.display(),
            backend_count = snapshot.passthrough.len(),
            has_default = snapshot.passthrough.default.is_some(),
            server_count = snapshot.configuration.servers.len(),
            "Snapshot loaded"
        );

        Ok(snapshot)
    }

    /// Reject configuration that must never reach a live session.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        let backends = self
            .passthrough
            .backends
            .iter()
            .chain(self.passthrough.default.iter());
        for backend in backends {
            if backend.port == 0 {
                return Err(SnapshotError::InvalidPort {
                    hostname: backend.hostname.clone(),
                    address: backend.address.clone(),
                });
            }
        }

        for server in &self.configuration.servers {
            for location in &server.locations {
                for cidr in &location.whitelist.cidr {
                    parse_cidr(&server.hostname, cidr)?;
                }
            }
        }

        Ok(())
    }
}

/// Holder of the current snapshot.
///
/// Uses ArcSwap for lock-free atomic updates.
/// Readers get consistent snapshots without blocking.
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
}

impl SnapshotStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The snapshot in effect right now.
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Replace the snapshot atomically.
    pub fn store(&self, snapshot: Snapshot) {
        let backend_count = snapshot.passthrough.len();
        let server_count = snapshot.configuration.servers.len();
        self.current.store(Arc::new(snapshot));

        info!(
            backend_count = backend_count,
            server_count = server_count,
            "Snapshot swapped atomically"
        );
    }

    /// Reload from `path`, keeping the current snapshot if loading fails.
    pub fn reload_from(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot::from_file(path)?;
        self.store(snapshot);
        Ok(())
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}
