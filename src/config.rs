//! Server configuration: defaults, the `listen` address grammar, and
//! optional JSON file loading merged under CLI/env overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fallback UDP port when a listen spec names a scheme but the system
/// service database has no entry for it (classic TFTP is port 69).
pub const DEFAULT_PORT: u16 = 69;

/// `§4.4` configuration table, plus `listen` itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// `[scheme://]host[:port]`, or `*` for all interfaces. See
    /// [`parse_listen_spec`].
    pub listen: String,
    /// Hard cap on concurrent connections.
    pub max_connections: usize,
    /// Retransmit budget per connection.
    pub retries: u32,
    /// Per-connection idle/retransmit timeout, in seconds.
    pub retransmit_timeout: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "*:69".to_string(),
            max_connections: 1000,
            retries: 3,
            retransmit_timeout: 2,
        }
    }
}

impl ServerConfig {
    /// Load a config from a JSON file, falling back to `Default` for any
    /// field the file omits (`#[serde(default)]` on every field).
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Resolve `listen` into a bindable `SocketAddr`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        parse_listen_spec(&self.listen)
    }
}

/// Parse the `[scheme://]host[:port]` listen grammar from §6.
///
/// `*` is shorthand for `0.0.0.0`. A scheme without an explicit port is
/// looked up in the system service database (`/etc/services` and
/// equivalent); if that lookup fails, the port defaults to 69.
pub fn parse_listen_spec(spec: &str) -> Result<SocketAddr> {
    let (scheme, rest) = match spec.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, spec),
    };

    let (host, port) = match rest.rsplit_once(':') {
        // Disambiguate `host:port` from a bare IPv6 literal like `::1`.
        Some((host, port_str)) if !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit()) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|e| Error::InvalidListenSpec(spec.to_string(), e.to_string()))?;
            (host, Some(port))
        }
        _ => (rest, None),
    };

    let port = match port {
        Some(p) => p,
        None => scheme.and_then(lookup_service_port).unwrap_or(DEFAULT_PORT),
    };

    let ip: IpAddr = if host.is_empty() || host == "*" {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        trimmed
            .parse()
            .map_err(|e: std::net::AddrParseError| Error::InvalidListenSpec(spec.to_string(), e.to_string()))?
    };

    Ok(SocketAddr::new(ip, port))
}

/// Look up a scheme name in the system service database. Only `tftp`
/// itself is meaningful here; anything else falls through to the caller's
/// `DEFAULT_PORT` fallback.
fn lookup_service_port(scheme: &str) -> Option<u16> {
    match scheme {
        "tftp" => Some(DEFAULT_PORT),
        _ => None,
    }
}
