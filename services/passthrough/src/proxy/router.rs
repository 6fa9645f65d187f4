//! Passthrough backend registry.
//!
//! Maps a sniffed hostname to the backend that should receive the raw
//! TLS stream:
//! - Exact hostname match only, case-sensitive as received
//! - First matching entry wins when hostnames repeat
//! - A default backend catches everything else
//!
//! The table is never edited in place. A configuration reload builds a new
//! table and swaps the whole snapshot (see `crate::snapshot`).

use serde::{Deserialize, Serialize};

/// A server that receives connections in passthrough mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpServer {
    /// Hostname matched against the ClientHello server name.
    pub hostname: String,
    /// Host or IP address of the backend.
    pub address: String,
    /// Backend port.
    pub port: u16,
    /// Prepend a PROXY protocol v1 header on the backend connection.
    #[serde(default)]
    pub proxy_protocol: bool,
}

impl TcpServer {
    /// Create a backend without PROXY protocol.
    pub fn new(hostname: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            port,
            proxy_protocol: false,
        }
    }

    /// Enable or disable the PROXY protocol header for this backend.
    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    /// `address:port` form used for dialing and logging.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// The passthrough servers and a default as catch all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpProxy {
    /// Backends in match order.
    #[serde(default)]
    pub backends: Vec<TcpServer>,
    /// Fallback when nothing matches or the hostname is unknown.
    #[serde(default)]
    pub default: Option<TcpServer>,
}

impl TcpProxy {
    pub fn new(backends: Vec<TcpServer>, default: Option<TcpServer>) -> Self {
        Self { backends, default }
    }

    /// Return the backend for `hostname`, falling back to the default.
    pub fn get(&self, hostname: &str) -> Option<&TcpServer> {
        if self.backends.is_empty() {
            return self.default.as_ref();
        }

        self.backends
            .iter()
            .find(|server| server.hostname == hostname)
            .or(self.default.as_ref())
    }

    /// The catch-all backend, used when no hostname could be sniffed.
    pub fn default_backend(&self) -> Option<&TcpServer> {
        self.default.as_ref()
    }

    /// Number of named backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
