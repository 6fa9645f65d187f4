//! PROXY protocol v1 header generation.
//!
//! Backends that sit behind the passthrough can learn the real client
//! address from a single text line written before any client bytes:
//!
//! ```text
//! PROXY TCP4 198.51.100.7 10.0.0.5 54321 443\r\n
//! ```
//!
//! Fields: protocol family, source address, destination address, source
//! port, destination port. The destination is the address the client
//! connected to on this proxy.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Line terminator required by the protocol.
const CRLF: &str = "\r\n";

/// Protocol family announced in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFamily {
    Tcp4,
    Tcp6,
    Unknown,
}

impl ProxyFamily {
    /// Family for a client address; IPv4 (including IPv4-mapped IPv6) first.
    pub fn of(addr: IpAddr) -> Self {
        match addr.to_canonical() {
            IpAddr::V4(_) => ProxyFamily::Tcp4,
            IpAddr::V6(_) => ProxyFamily::Tcp6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyFamily::Tcp4 => "TCP4",
            ProxyFamily::Tcp6 => "TCP6",
            ProxyFamily::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ProxyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PROXY protocol v1 header generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address and port, if known.
    pub src_addr: Option<SocketAddr>,
    /// Proxy-side address the client connected to, if known.
    pub dst_addr: Option<SocketAddr>,
}

impl ProxyHeader {
    /// Header for a client connection observed at `dst_addr`.
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            src_addr: Some(src_addr),
            dst_addr: Some(dst_addr),
        }
    }

    /// Header for a connection whose addresses could not be determined.
    pub fn unknown() -> Self {
        Self {
            src_addr: None,
            dst_addr: None,
        }
    }

    pub fn family(&self) -> ProxyFamily {
        match self.src_addr {
            Some(addr) => ProxyFamily::of(addr.ip()),
            None => ProxyFamily::Unknown,
        }
    }

    /// Render the header line, including the trailing CRLF.
    pub fn encode(&self) -> String {
        match (self.src_addr, self.dst_addr) {
            (Some(src), Some(dst)) => format!(
                "PROXY {} {} {} {} {}{}",
                self.family(),
                src.ip().to_canonical(),
                dst.ip().to_canonical(),
                src.port(),
                dst.port(),
                CRLF
            ),
            _ => format!("PROXY {}{}", ProxyFamily::Unknown, CRLF),
        }
    }
}

impl fmt::Display for ProxyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode().trim_end_matches(CRLF))
    }
}
