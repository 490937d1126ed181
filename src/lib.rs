//! authgate library
//!
//! Authenticating reverse proxy: every inbound request is classified by the
//! [`gatekeeper::Gatekeeper`] before it is forwarded upstream.
//!
//! # Features
//!
//! - **Bypasses**: CORS preflight, trusted client IPs/CIDRs, exempt paths
//! - **Credentials**: JWT bearer tokens, session cookies, htpasswd basic auth
//! - **Sessions**: in-cookie (chunked, optionally encrypted) or server-side
//!   tickets over Redis single node, Sentinel or Cluster
//! - **Providers**: OIDC with discovery, plain OAuth2
//! - **Upstreams**: identity headers, GAP request signatures, streaming responses
//!
//! Every infrastructure failure fails closed: the request is treated as
//! unauthenticated, never as authenticated.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod gateway;
pub mod matcher;
pub mod provider;
pub mod session;
pub mod signer;
pub mod verifier;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
