//! Real client IP resolution.

use std::net::{IpAddr, SocketAddr};

use axum::http::{HeaderMap, HeaderName};

use crate::{Error, Result};

/// Resolves the client IP used for trusted-IP checks.
///
/// Without `reverse_proxy` the socket peer is authoritative and headers are
/// ignored, so a client cannot claim a trusted address by sending one.
#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    header: Option<HeaderName>,
}

impl ClientIpResolver {
    /// Build a resolver. `header` is only consulted when `reverse_proxy` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the header is not one of `X-Real-IP`,
    /// `X-Forwarded-For` or `X-ProxyUser-IP`.
    pub fn new(reverse_proxy: bool, header: &str) -> Result<Self> {
        if !reverse_proxy {
            return Ok(Self { header: None });
        }

        let name = header.to_ascii_lowercase();
        if !matches!(name.as_str(), "x-real-ip" | "x-forwarded-for" | "x-proxyuser-ip") {
            return Err(Error::Config(format!(
                "Unsupported real_client_ip_header '{header}'"
            )));
        }

        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid header name '{header}': {e}")))?;
        Ok(Self {
            header: Some(header),
        })
    }

    /// Resolve the client IP. A malformed header yields `None`, never a guess.
    #[must_use]
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        let Some(ref header) = self.header else {
            return peer.map(|p| p.ip());
        };

        let value = headers.get(header)?.to_str().ok()?;
        // X-Forwarded-For: client, proxy1, proxy2
        let first = value.split(',').next()?.trim();
        parse_ip(first)
    }
}

/// Accept `1.2.3.4`, `1.2.3.4:5678`, `::1` and `[::1]:5678`.
fn parse_ip(s: &str) -> Option<IpAddr> {
    s.parse::<IpAddr>()
        .ok()
        .or_else(|| s.parse::<SocketAddr>().ok().map(|sa| sa.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(name: &'static str, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, value.parse().unwrap());
        h
    }

    #[test]
    fn socket_peer_used_without_reverse_proxy() {
        let resolver = ClientIpResolver::new(false, "X-Real-IP").unwrap();
        let peer: SocketAddr = "203.0.113.9:4000".parse().unwrap();

        // Header is ignored even if present
        let ip = resolver.resolve(&headers("x-real-ip", "10.0.0.1"), Some(peer));
        assert_eq!(ip, Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn real_ip_header_behind_proxy() {
        let resolver = ClientIpResolver::new(true, "X-Real-IP").unwrap();
        let ip = resolver.resolve(&headers("x-real-ip", "10.0.0.1"), None);
        assert_eq!(ip, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let resolver = ClientIpResolver::new(true, "X-Forwarded-For").unwrap();
        let ip = resolver.resolve(&headers("x-forwarded-for", "198.51.100.4, 10.0.0.2"), None);
        assert_eq!(ip, Some("198.51.100.4".parse().unwrap()));
    }

    #[test]
    fn address_with_port_is_accepted() {
        let resolver = ClientIpResolver::new(true, "X-Real-IP").unwrap();
        let ip = resolver.resolve(&headers("x-real-ip", "[2001:db8::1]:443"), None);
        assert_eq!(ip, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn malformed_header_resolves_to_none() {
        let resolver = ClientIpResolver::new(true, "X-Real-IP").unwrap();
        assert_eq!(resolver.resolve(&headers("x-real-ip", "garbage"), None), None);
        assert_eq!(resolver.resolve(&HeaderMap::new(), None), None);
    }

    #[test]
    fn unsupported_header_is_rejected() {
        assert!(ClientIpResolver::new(true, "X-Client").is_err());
    }
}
