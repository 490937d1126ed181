//! Trusted IP ranges.
//!
//! Entries are either bare addresses (`192.168.1.7`, `::1`) or CIDR ranges
//! (`10.0.0.0/8`, `fd00::/8`). IPv4-mapped IPv6 addresses (`::ffff:10.1.2.3`)
//! are unwrapped to IPv4 on both sides, since dual-stack listeners report IPv4
//! peers in that form.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};

use crate::{Error, Result};

/// Parse `addr` or `addr/prefix` into a network with host bits cleared.
///
/// # Errors
///
/// Returns [`Error::Config`] for malformed addresses or out-of-range prefixes.
pub fn parse_network(s: &str) -> Result<IpNet> {
    let s = s.trim();
    let net = match s.parse::<IpNet>() {
        Ok(net) => net,
        Err(_) if !s.contains('/') => s
            .parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|e| Error::Config(format!("Invalid trusted IP '{s}': {e}")))?,
        Err(e) => return Err(Error::Config(format!("Invalid trusted network '{s}': {e}"))),
    };
    Ok(unmap_network(net).trunc())
}

/// `::ffff:a.b.c.d/len` with `len >= 96` becomes `a.b.c.d/(len - 96)`.
fn unmap_network(net: IpNet) -> IpNet {
    let IpNet::V6(v6) = net else { return net };
    match (v6.addr().to_ipv4_mapped(), v6.prefix_len().checked_sub(96)) {
        (Some(v4), Some(prefix)) => Ipv4Net::new(v4, prefix).map_or(net, IpNet::V4),
        _ => net,
    }
}

/// Unwrap IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to plain IPv4.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Ordered set of trusted networks. Immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct TrustedIps {
    networks: Vec<IpNet>,
}

impl TrustedIps {
    /// Parse every configured entry.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed entry.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let networks = entries
            .iter()
            .map(|e| parse_network(e.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { networks })
    }

    /// Returns `true` if `ip` is inside any trusted network.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = normalize(ip);
        self.networks.iter().any(|n| n.contains(&ip))
    }

    /// Returns `true` when no networks are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
