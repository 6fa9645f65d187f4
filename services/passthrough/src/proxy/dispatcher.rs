//! Per-connection dispatch.
//!
//! A session runs straight through, with no retries:
//!
//! ```text
//! read -> sniff -> select backend -> authorize -> connect
//!      -> PROXY header (optional) -> replay -> relay
//! ```
//!
//! Any failure closes the client connection without writing to it. A
//! ClientHello must arrive in the first read; a hello split across several
//! segments is sniffed as unresolved and goes to the default backend.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::allowlist::{authorize, Authorization};
use super::proxy_protocol::ProxyHeader;
use super::relay::{relay, RelayOutcome};
use super::router::TcpServer;
use super::sni::extract_sni;
use crate::error::DispatchError;
use crate::snapshot::Snapshot;

/// Size of the single initial read that must contain the ClientHello.
pub const SNIFF_BUFFER_SIZE: usize = 4096;

/// Summary of a session that reached the relay phase.
#[derive(Debug, Clone)]
pub struct Session {
    /// Client address.
    pub peer_addr: SocketAddr,
    /// Hostname from the ClientHello, if one was found.
    pub hostname: Option<String>,
    /// Backend the connection was relayed to.
    pub backend: TcpServer,
    /// Result of the allowlist check.
    pub authorization: Authorization,
    /// Whether a PROXY header was written.
    pub proxy_header_sent: bool,
    /// How the relay ended.
    pub relay: RelayOutcome,
}

/// Handle one accepted client connection against `snapshot`.
///
/// The client connection is closed when this returns, on every path.
pub async fn handle(mut client: TcpStream, snapshot: &Snapshot) -> Result<Session, DispatchError> {
    let peer_addr = client.peer_addr().map_err(DispatchError::Read)?;

    // Read
    let mut buffer = vec![0u8; SNIFF_BUFFER_SIZE];
    let length = client.read(&mut buffer).await.map_err(DispatchError::Read)?;
    if length == 0 {
        return Err(DispatchError::EmptyRead);
    }
    buffer.truncate(length);

    // Sniff
    let hostname = match extract_sni(&buffer) {
        Ok(hostname) => {
            debug!(hostname = %hostname, "Parsed hostname from TLS ClientHello");
            Some(hostname)
        }
        Err(e) => {
            debug!(error = %e, bytes = length, "No hostname in initial bytes");
            None
        }
    };

    // Select backend
    let backend = match hostname.as_deref() {
        Some(name) => snapshot.passthrough.get(name),
        None => snapshot.passthrough.default_backend(),
    };
    let Some(backend) = backend.cloned() else {
        return Err(DispatchError::NoBackend { hostname });
    };

    // Authorize
    let server_name = hostname.as_deref().unwrap_or_default();
    let authorization = authorize(&snapshot.configuration, server_name, peer_addr.ip())?;
    match authorization {
        Authorization::Unrestricted => {
            debug!(hostname = %server_name, "No passthrough server entry, allowlist not applied");
        }
        Authorization::Allowed => {}
        Authorization::Denied => {
            return Err(DispatchError::Denied {
                hostname: server_name.to_string(),
                client: peer_addr,
            });
        }
    }

    // Connect
    let endpoint = backend.endpoint();
    let mut upstream = TcpStream::connect((backend.address.as_str(), backend.port))
        .await
        .map_err(|source| DispatchError::Connect {
            backend: endpoint.clone(),
            source,
        })?;
    debug!(backend = %endpoint, "Connected to backend");

    // Preamble
    let header = backend.proxy_protocol.then(|| match client.local_addr() {
        Ok(local_addr) => ProxyHeader::new(peer_addr, local_addr),
        Err(e) => {
            warn!(error = %e, "Local address unavailable, sending UNKNOWN PROXY header");
            ProxyHeader::unknown()
        }
    });
    if let Some(header) = &header {
        debug!(header = %header, "Writing PROXY protocol header");
    }

    // Replay. On failure both sockets are dropped here, before any relaying.
    forward_initial_bytes(&mut upstream, header.as_ref(), &buffer).await?;

    // Relay
    let outcome = relay(client, upstream).await;

    Ok(Session {
        peer_addr,
        hostname,
        proxy_header_sent: backend.proxy_protocol,
        backend,
        authorization,
        relay: outcome,
    })
}

/// Write the optional PROXY header, then the bytes already read from the
/// client, to a freshly connected backend.
async fn forward_initial_bytes<W>(
    upstream: &mut W,
    header: Option<&ProxyHeader>,
    initial: &[u8],
) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(header) = header {
        upstream
            .write_all(header.encode().as_bytes())
            .await
            .map_err(DispatchError::Preamble)?;
    }

    upstream
        .write_all(initial)
        .await
        .map_err(DispatchError::Replay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio_test::io::Builder;

    fn header() -> ProxyHeader {
        ProxyHeader::new(
            "198.51.100.7:54321".parse().unwrap(),
            "10.0.0.5:443".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_header_then_initial_bytes() {
        let header = header();
        let mut upstream = Builder::new()
            .write(b"PROXY TCP4 198.51.100.7 10.0.0.5 54321 443\r\n")
            .write(b"hello")
            .build();

        forward_initial_bytes(&mut upstream, Some(&header), b"hello")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initial_bytes_only_without_header() {
        let mut upstream = Builder::new().write(b"hello").build();

        forward_initial_bytes(&mut upstream, None, b"hello")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_preamble_write_failure_skips_replay() {
        let header = header();
        let mut upstream = Builder::new()
            .write_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let err = forward_initial_bytes(&mut upstream, Some(&header), b"hello")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Preamble(_)));
        assert!(err.is_backend_failure());
        assert_eq!(err.reason_code(), "preamble_failed");
    }

    #[tokio::test]
    async fn test_replay_write_failure() {
        let header = header();
        let mut upstream = Builder::new()
            .write(b"PROXY TCP4 198.51.100.7 10.0.0.5 54321 443\r\n")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();

        let err = forward_initial_bytes(&mut upstream, Some(&header), b"hello")
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Replay(_)));
        assert_eq!(err.reason_code(), "replay_failed");
    }
}
