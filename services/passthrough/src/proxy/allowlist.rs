//! Source-IP allowlists for passthrough servers.
//!
//! A server entry takes part in admission only when its hostname equals the
//! sniffed hostname and passthrough is enabled for it. When no such entry
//! exists the connection is not checked at all ([`Authorization::Unrestricted`]).
//! When one exists, the client must fall inside at least one CIDR of one of
//! its locations; an entry without any CIDR admits nobody.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use thiserror::Error;

use crate::snapshot::{Configuration, Server};

/// Allowlist configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllowlistError {
    /// A whitelist entry is not valid CIDR notation.
    #[error("invalid CIDR {cidr:?} for server {hostname:?}: {reason}")]
    InvalidCidr {
        hostname: String,
        cidr: String,
        reason: String,
    },
}

/// Outcome of the allowlist check for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// No passthrough server entry matches the hostname; nothing was checked.
    Unrestricted,
    /// The client address is inside one of the server's CIDRs.
    Allowed,
    /// The server has an allowlist and the client is not on it.
    Denied,
}

impl Authorization {
    /// Whether the connection may proceed.
    pub fn is_permitted(self) -> bool {
        !matches!(self, Authorization::Denied)
    }
}

/// Find the server entry that governs admission for `hostname`.
pub fn find_passthrough_server<'a>(
    configuration: &'a Configuration,
    hostname: &str,
) -> Option<&'a Server> {
    configuration
        .servers
        .iter()
        .find(|server| server.hostname == hostname && server.ssl_passthrough)
}

/// Decide whether `client` may reach the backend selected for `hostname`.
pub fn authorize(
    configuration: &Configuration,
    hostname: &str,
    client: IpAddr,
) -> Result<Authorization, AllowlistError> {
    let Some(server) = find_passthrough_server(configuration, hostname) else {
        return Ok(Authorization::Unrestricted);
    };

    if server_admits(server, client)? {
        Ok(Authorization::Allowed)
    } else {
        Ok(Authorization::Denied)
    }
}

/// Scan every location of `server` in order, stopping at the first network
/// that contains `client`.
pub fn server_admits(server: &Server, client: IpAddr) -> Result<bool, AllowlistError> {
    let client = client.to_canonical();

    for location in &server.locations {
        for cidr in &location.whitelist.cidr {
            let network = canonical_network(parse_cidr(&server.hostname, cidr)?);
            if network.contains(&client) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Rewrite an IPv4-mapped IPv6 network (`::ffff:a.b.c.d/n`, n >= 96) as the
/// IPv4 network it covers, so it matches canonicalized IPv4 clients.
fn canonical_network(network: IpNet) -> IpNet {
    match network {
        IpNet::V6(net) if net.prefix_len() >= 96 => net
            .addr()
            .to_ipv4_mapped()
            .and_then(|addr| Ipv4Net::new(addr, net.prefix_len() - 96).ok())
            .map_or(network, IpNet::V4),
        _ => network,
    }
}

/// Parse one whitelist entry.
pub fn parse_cidr(hostname: &str, cidr: &str) -> Result<IpNet, AllowlistError> {
    cidr.parse::<IpNet>()
        .map_err(|e| AllowlistError::InvalidCidr {
            hostname: hostname.to_string(),
            cidr: cidr.to_string(),
            reason: e.to_string(),
        })
}
