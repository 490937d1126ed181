//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::gatekeeper::Gatekeeper;
use crate::provider::build_provider;
use crate::session::build_store;
use crate::verifier::{BearerIssuer, TokenVerifier, VerifierPool, discovery};
use crate::{Error, Result};

/// Authenticating reverse proxy server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Build every startup collaborator: provider discovery, bearer
    /// verifiers, session store and gatekeeper.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, discovery fails
    /// after retries, or the session backend cannot be reached.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        let verifiers = Arc::new(VerifierPool::new());
        let provider = build_provider(&config.provider, http.clone(), Arc::clone(&verifiers)).await?;
        info!(provider = %provider.id(), kind = ?config.provider.kind, "Identity provider ready");

        if config.auth.skip_jwt_bearer_tokens {
            register_bearer_issuers(&config, &http, &verifiers).await?;
        }

        let store = build_store(&config).await?;

        let gatekeeper = Arc::new(Gatekeeper::from_config(
            &config,
            store,
            provider,
            verifiers,
        )?);
        let state = Arc::new(AppState::new(&config, gatekeeper, http)?);

        Ok(Self { config, state })
    }

    /// Run the gateway until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("AUTHGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(strategies = ?self.state.gatekeeper.strategies(), "Authentication chain");
        for upstream in &self.config.upstreams {
            info!("  {} -> {}", upstream.path, upstream.url);
        }
        if self.config.upstreams.is_empty() {
            warn!("No upstreams configured - authorized requests will get 404");
        }
        info!("============================================================");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Register one bearer verifier per accepted issuer: the provider's own
/// issuer (audience = client ID) plus every `extra_jwt_issuers` entry.
async fn register_bearer_issuers(config: &Config, http: &Client, verifiers: &VerifierPool) -> Result<()> {
    let mut issuers = BearerIssuer::group(&BearerIssuer::parse_all(&config.auth.extra_jwt_issuers)?);
    if let Some(ref issuer) = config.provider.issuer_url {
        match issuers.iter_mut().find(|(i, _)| i == issuer) {
            Some((_, audiences)) => audiences.push(config.provider.client_id.clone()),
            None => issuers.push((issuer.clone(), vec![config.provider.client_id.clone()])),
        }
    }

    let attempts = config.provider.discovery_attempts;
    for (issuer, audiences) in issuers {
        let jwks_uri = match (config.provider.issuer_url.as_deref(), config.provider.jwks_url.as_deref()) {
            (Some(own), Some(jwks)) if own == issuer && config.provider.skip_discovery => jwks.to_string(),
            _ => discovery::discover(http, &issuer, attempts).await?.jwks_uri,
        };
        let jwks = discovery::fetch_jwks(http, &jwks_uri, attempts).await?;
        info!(issuer = %issuer, audiences = ?audiences, "Registered bearer issuer");
        verifiers.insert_bearer(TokenVerifier::from_jwks(issuer, audiences, &jwks));
    }
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
