//! TCP listener and connection handling.
//!
//! This module owns the accept loop. Every accepted connection pins the
//! snapshot that is current at accept time and runs through
//! [`dispatcher::handle`](super::dispatcher::handle) in its own task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::dispatcher;
use crate::error::DispatchError;
use crate::snapshot::SnapshotStore;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Sessions where a hostname was sniffed.
    pub sni_found: AtomicU64,
    /// Sessions relayed without a hostname.
    pub sni_failed: AtomicU64,
    /// Sessions refused by an allowlist.
    pub denied: AtomicU64,
    /// Sessions with no backend to route to.
    pub no_backend: AtomicU64,
    /// Backend connect or write failures.
    pub backend_failed: AtomicU64,
    /// Sessions that completed the relay phase.
    pub relayed: AtomicU64,
    /// Bytes copied by the first relay direction to finish, summed over sessions.
    pub bytes_relayed: AtomicU64,
}

impl ListenerStats {
    fn record(&self, result: &Result<dispatcher::Session, DispatchError>) {
        match result {
            Ok(session) => {
                self.relayed.fetch_add(1, Ordering::Relaxed);
                if let Some(bytes) = session.relay.bytes {
                    self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
                }
                if session.hostname.is_some() {
                    self.sni_found.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.sni_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(DispatchError::Denied { .. }) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
            }
            Err(DispatchError::NoBackend { .. }) => {
                self.no_backend.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_backend_failure() => {
                self.backend_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}

/// A TCP listener for the passthrough dispatcher.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Source of the per-connection snapshot.
    snapshots: Arc<SnapshotStore>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, snapshots: Arc<SnapshotStore>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            snapshots,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    ///
    /// Returns an error only when a session hits configuration that can
    /// never be valid; the process is expected to exit.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<DispatchError>();

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                Some(fatal) = fatal_rx.recv() => {
                    error!(error = %fatal, "Invalid configuration reached a live session");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, fatal));
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let snapshot = self.snapshots.load();
                    let stats = Arc::clone(&self.stats);
                    let fatal_tx = fatal_tx.clone();

                    tokio::spawn(
                        async move {
                            let result = dispatcher::handle(stream, &snapshot).await;
                            stats.record(&result);

                            match result {
                                Ok(session) => debug!(
                                    hostname = session.hostname.as_deref().unwrap_or(""),
                                    backend = %session.backend.endpoint(),
                                    proxy_header = session.proxy_header_sent,
                                    relay_direction = ?session.relay.direction,
                                    relay_bytes = ?session.relay.bytes,
                                    "Connection closed"
                                ),
                                Err(e) if e.is_fatal() => {
                                    let _ = fatal_tx.send(e);
                                }
                                Err(e @ DispatchError::Denied { .. }) => {
                                    debug!(reason = e.reason_code(), error = %e, "Whitelisting is not allowing this connection")
                                }
                                Err(e) if e.is_backend_failure() => {
                                    warn!(reason = e.reason_code(), error = %e, "Backend failure")
                                }
                                Err(e) => {
                                    debug!(reason = e.reason_code(), error = %e, "Connection aborted")
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}
