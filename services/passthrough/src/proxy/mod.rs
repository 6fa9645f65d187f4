//! TLS passthrough dispatch.
//!
//! This module provides:
//! - TCP listener management
//! - SNI extraction from the first client bytes
//! - Hostname routing with a default backend
//! - Per-server source-IP allowlists
//! - PROXY protocol v1 injection
//! - Full-duplex relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Dispatcher -> SNI -> Router -> Allowlist -> Backend
//!                                                                    |
//!                                                 PROXY v1 header (if enabled)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig};
//! use snapshot::{Snapshot, SnapshotStore};
//!
//! let snapshots = Arc::new(SnapshotStore::new(Snapshot::from_file(path)?));
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Listener::bind(config, snapshots).await?;
//! Arc::new(listener).run().await?;
//! ```

mod allowlist;
mod dispatcher;
mod listener;
mod proxy_protocol;
mod relay;
mod router;
mod sni;

pub use allowlist::{
    authorize, find_passthrough_server, parse_cidr, server_admits, AllowlistError, Authorization,
};
pub use dispatcher::{handle, Session, SNIFF_BUFFER_SIZE};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use proxy_protocol::{ProxyFamily, ProxyHeader};
pub use relay::{relay, Direction, RelayOutcome};
pub use router::{TcpProxy, TcpServer};
pub use sni::{extract_sni, SniError};
