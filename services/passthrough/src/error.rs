//! Error types for passthrough sessions.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::proxy::AllowlistError;

/// Reasons a session ended before or during relaying.
///
/// The client never learns which one occurred: every variant results in the
/// inbound connection being closed without a response.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Reading the initial bytes failed.
    #[error("read_failed: {0}")]
    Read(#[source] io::Error),

    /// The client closed before sending anything.
    #[error("empty_read: connection closed before any data")]
    EmptyRead,

    /// Neither a named nor a default backend is configured.
    #[error("no_backend: no passthrough backend for hostname {hostname:?}")]
    NoBackend { hostname: Option<String> },

    /// The client address is outside the server's allowlist.
    #[error("denied: {client} not allowed for {hostname:?}")]
    Denied { hostname: String, client: SocketAddr },

    /// The backend could not be reached.
    #[error("connect_failed: {backend}: {source}")]
    Connect {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Writing the PROXY protocol header failed.
    #[error("preamble_failed: {0}")]
    Preamble(#[source] io::Error),

    /// Replaying the initial client bytes to the backend failed.
    #[error("replay_failed: {0}")]
    Replay(#[source] io::Error),

    /// The snapshot carries configuration that can never be valid.
    #[error("invalid_configuration: {0}")]
    InvalidConfiguration(#[from] AllowlistError),
}

impl DispatchError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DispatchError::Read(_) => "read_failed",
            DispatchError::EmptyRead => "empty_read",
            DispatchError::NoBackend { .. } => "no_backend",
            DispatchError::Denied { .. } => "denied",
            DispatchError::Connect { .. } => "connect_failed",
            DispatchError::Preamble(_) => "preamble_failed",
            DispatchError::Replay(_) => "replay_failed",
            DispatchError::InvalidConfiguration(_) => "invalid_configuration",
        }
    }

    /// Whether this error must stop the whole process rather than one session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::InvalidConfiguration(_))
    }

    /// Whether the failure happened after a backend was selected.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::Connect { .. } | DispatchError::Preamble(_) | DispatchError::Replay(_)
        )
    }
}
