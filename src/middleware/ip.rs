//! Client key resolution.
//!
//! The client key partitions rate-limiting state and appears in access log
//! lines. It is the textual IP address of the caller.
//!
//! # Resolution Order
//!
//! 1. The TCP peer address (`ConnectInfo<SocketAddr>`, inserted by the
//!    listener) is the default.
//! 2. When the peer itself lies inside a `TRUSTED_PROXIES` range, the first
//!    entry of `X-Forwarded-For` is used instead, then `X-Real-IP`.
//!    Header values that do not parse as an IP address are ignored.
//! 3. Requests with no peer address (e.g. driven in-process) share
//!    [`UNKNOWN_CLIENT`].
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Forwarding headers are client-controlled. They are only honoured from
//! trusted proxies, so a direct caller cannot rotate spoofed addresses to
//! bypass rate limiting. Configure your proxy to overwrite (not append to)
//! client IP headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! An empty `TRUSTED_PROXIES` list disables header resolution entirely.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

use crate::context::ClientKey;

/// Fallback key when no client address can be determined.
///
/// All such requests share one bucket.
pub const UNKNOWN_CLIENT: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is treated as a single-host range. Returns `None` if the
    /// format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.parse::<IpAddr>().ok()?, prefix.parse::<u8>().ok()?),
            None => {
                let ip = cidr.parse::<IpAddr>().ok()?;
                (ip, Self::max_prefix(&ip))
            }
        };

        if prefix_len > Self::max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    fn max_prefix(ip: &IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4-mapped peers (::ffff:a.b.c.d) against an IPv4 range
            (IpAddr::V4(_), IpAddr::V6(addr)) => addr
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(&IpAddr::V4(v4))),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

/// Set of proxy networks whose forwarding headers are honoured.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<CidrRange>,
}

impl TrustedProxies {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy ranges configured");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Check whether `ip` lies inside any configured range.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// First `X-Forwarded-For` entry, else `X-Real-IP`, if it parses as an IP.
fn forwarded_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let headers = req.headers();

    // Format: "client, proxy1, proxy2" - the first entry is the client
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
    {
        return Some(ip);
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
}

fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client key for a request.
pub fn resolve_client_key<B>(req: &Request<B>, trusted: &TrustedProxies) -> ClientKey {
    let Some(peer) = peer_ip(req) else {
        return ClientKey::unknown();
    };

    if trusted.is_trusted(&peer) {
        if let Some(client) = forwarded_ip(req) {
            return ClientKey::from(client.to_string());
        }
        debug!(peer = %peer, "Trusted proxy sent no usable forwarding header");
    }

    ClientKey::from(peer.to_string())
}
