//! Inbound request model and client identifier extraction.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config::ProxyConfig;

/// Identifier used when no client address can be resolved.
pub const FALLBACK_IDENTIFIER: &str = "127.0.0.1";

/// The parts of an inbound request the engine looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRequest {
    /// HTTP method.
    pub method: String,
    /// Request URL or path, including the query string.
    pub url: String,
    /// Request headers, keyed by lower-cased name.
    #[serde(default, deserialize_with = "lowercase_keys")]
    pub headers: BTreeMap<String, String>,
    /// Peer address of the socket, if known.
    #[serde(default)]
    pub remote_addr: Option<String>,
}

fn lowercase_keys<'de, D>(d: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, String>::deserialize(d)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect())
}

impl FilterRequest {
    /// Create a request without headers or peer address.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            remote_addr: None,
        }
    }

    /// Add a header. The name is stored lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the socket peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Look up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The `User-Agent` header, or an empty string.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or_default()
    }
}

/// Resolve the client identifier for a request.
///
/// Proxy headers are read, in configured order, only when the socket peer is
/// a trusted proxy. In `X-Forwarded-For` style lists the right-most address
/// that is not itself a trusted proxy is the client; everything left of it
/// was supplied by the client. Falls back to the socket address, then to
/// [`FALLBACK_IDENTIFIER`].
#[must_use]
pub fn extract_identifier(request: &FilterRequest, proxy: &ProxyConfig) -> String {
    let peer = peer_address(request);
    let via_proxy = peer.is_some_and(|ip| proxy.trust_proxy_headers && proxy.is_trusted(ip));

    if via_proxy {
        for name in &proxy.headers {
            let Some(value) = request.header(name) else {
                continue;
            };
            if let Some(ip) = forwarded_client(value, proxy) {
                return normalize(ip);
            }
        }
    }

    peer.map_or_else(|| FALLBACK_IDENTIFIER.to_string(), normalize)
}

/// The socket peer, with IPv4-mapped addresses collapsed.
#[must_use]
pub fn peer_address(request: &FilterRequest) -> Option<IpAddr> {
    request
        .remote_addr
        .as_deref()
        .and_then(parse_address)
        .map(canonical)
}

/// Client address from a comma-separated hop list. A list with any
/// unparseable hop is ignored as a whole.
fn forwarded_client(value: &str, proxy: &ProxyConfig) -> Option<IpAddr> {
    let hops = value
        .split(',')
        .map(|hop| parse_address(hop).map(canonical))
        .collect::<Option<Vec<_>>>()?;
    hops.iter()
        .rev()
        .find(|ip| !proxy.is_trusted(**ip))
        .or_else(|| hops.first())
        .copied()
}

/// Parse `ip`, `ip:port` or `[v6]:port`.
fn parse_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
        .or_else(|| {
            raw.strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .and_then(|r| r.parse().ok())
        })
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Canonical textual form; IPv4-mapped IPv6 collapses to plain IPv4.
#[must_use]
pub fn normalize(ip: IpAddr) -> String {
    canonical(ip).to_string()
}

/// Whether an identifier names the local machine.
#[must_use]
pub fn is_loopback(identifier: &str) -> bool {
    identifier
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}
