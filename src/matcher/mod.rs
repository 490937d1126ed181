//! Stateless request classifiers evaluated before any cryptographic work.
//!
//! - [`TrustedIps`]: CIDR membership of the resolved client IP
//! - [`PathBypass`]: regex exemptions on the request path
//! - [`ClientIpResolver`]: picks the client IP from the socket or a fronting proxy header
//!
//! All three are built once at startup and shared read-only across requests.

mod cidr;
mod client_ip;
mod path;

pub use cidr::{TrustedIps, parse_network};
pub use client_ip::ClientIpResolver;
pub use path::PathBypass;
