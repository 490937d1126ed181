//! HTTP router and shared state

use std::sync::Arc;

use axum::{Router, routing::get};
use reqwest::Client;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::proxy::UpstreamProxy;
use crate::Result;
use crate::config::{Config, ServerConfig};
use crate::gatekeeper::Gatekeeper;
use crate::matcher::ClientIpResolver;
use crate::session::{CookieSettings, SessionCodec};

/// Shared application state
pub struct AppState {
    /// Authorization engine
    pub gatekeeper: Arc<Gatekeeper>,
    /// Upstream router and forwarder
    pub proxy: UpstreamProxy,
    /// Real client IP resolution
    pub client_ip: ClientIpResolver,
    /// Signs the login CSRF cookie
    pub csrf: SessionCodec,
    /// Cookie attributes
    pub cookies: CookieSettings,
    /// Listener and routing settings
    pub server: ServerConfig,
}

impl AppState {
    /// Assemble state around an already-built gatekeeper.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed upstreams, signature key or client IP
    /// header.
    pub fn new(config: &Config, gatekeeper: Arc<Gatekeeper>, http: Client) -> Result<Self> {
        Ok(Self {
            gatekeeper,
            proxy: UpstreamProxy::from_config(config, http)?,
            client_ip: ClientIpResolver::new(config.server.reverse_proxy, &config.server.real_client_ip_header)?,
            csrf: SessionCodec::new(config.cookie.secret.as_bytes(), handlers::CSRF_TTL, false),
            cookies: CookieSettings::from_config(&config.cookie),
            server: config.server.clone(),
        })
    }

    /// Absolute path of a proxy endpoint (`/oauth2` + `suffix`).
    #[must_use]
    pub fn endpoint(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.server.proxy_prefix.trim_end_matches('/'))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.server.ping_path, get(handlers::ping))
        .route(&state.endpoint("/start"), get(handlers::start))
        .route(&state.endpoint("/callback"), get(handlers::callback))
        .route(&state.endpoint("/sign_out"), get(handlers::sign_out).post(handlers::sign_out))
        .route(&state.endpoint("/auth"), get(handlers::auth))
        .route(&state.endpoint("/userinfo"), get(handlers::userinfo))
        .fallback(handlers::proxy)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}
