//! Identity providers.
//!
//! Every provider implements the same [`Provider`] capability set (code
//! exchange, refresh, token validation) and is selected once at startup by
//! `provider.kind`. There is no shared base state; common token-endpoint
//! plumbing lives in [`TokenEndpoint`].

mod oauth2;
mod oidc;
mod token;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use url::Url;

pub use oauth2::OAuth2Provider;
pub use oidc::OidcProvider;
pub use token::{TokenEndpoint, TokenResponse};

use crate::config::{ProviderConfig, ProviderKind};
use crate::session::Session;
use crate::verifier::{Claims, VerifierPool};
use crate::{Error, Result};

/// Provider call failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The authorization code could not be exchanged for an identity
    #[error("Code exchange failed: {0}")]
    ExchangeFailed(String),

    /// The refresh grant was rejected or timed out
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// The presented token is not valid
    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    /// New access token
    pub access_token: String,
    /// Rotated refresh token, when the provider issued one
    pub refresh_token: Option<String>,
    /// New ID token, when the provider issued one
    pub id_token: Option<String>,
    /// New access token expiry
    pub expires_on: Option<DateTime<Utc>>,
}

impl RefreshedTokens {
    /// Derive the refreshed session from `session`.
    ///
    /// A refresh token that was not rotated is kept.
    #[must_use]
    pub fn apply(self, session: &Session) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or_else(|| session.refresh_token.clone()),
            id_token: self.id_token.or_else(|| session.id_token.clone()),
            expires_on: self.expires_on,
            created_at: Utc::now(),
            ..session.clone()
        }
    }
}

/// Identity provider capability set.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Identifier recorded in sessions.
    fn id(&self) -> &str;

    /// Authorization endpoint URL to send the browser to.
    fn login_url(&self, redirect_uri: &str, state: &str) -> String;

    /// Exchange an authorization code for a new session.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> std::result::Result<Session, ProviderError>;

    /// Redeem a refresh token.
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<RefreshedTokens, ProviderError>;

    /// Validate a token issued by this provider.
    async fn validate_token(&self, token: &str) -> std::result::Result<Claims, ProviderError>;

    /// The token of `session` that [`Provider::validate_token`] understands.
    fn session_token<'a>(&self, session: &'a Session) -> &'a str {
        &session.access_token
    }
}

/// Build the configured provider. OIDC providers are discovered and their
/// verifier registered in `pool`.
///
/// # Errors
///
/// Returns an error if discovery fails or required URLs are missing.
pub async fn build_provider(config: &ProviderConfig, client: Client, pool: Arc<VerifierPool>) -> Result<Arc<dyn Provider>> {
    Ok(match config.kind {
        ProviderKind::Oidc => Arc::new(OidcProvider::discover(config, client, pool).await?),
        ProviderKind::OAuth2 => Arc::new(OAuth2Provider::new(config, client)?),
    })
}

/// Authorization URL with the standard code-flow parameters.
pub(crate) fn authorization_url(
    endpoint: &Url,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
) -> String {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", scope)
        .append_pair("state", state);
    url.to_string()
}

pub(crate) fn parse_endpoint(name: &str, value: Option<&str>) -> Result<Url> {
    let value = value.ok_or_else(|| Error::Config(format!("provider.{name} is required")))?;
    Url::parse(value).map_err(|e| Error::Config(format!("Invalid provider.{name} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_keeps_unrotated_refresh_token() {
        let mut session = Session::new("alice", "oidc");
        session.refresh_token = Some("rt-1".to_string());
        session.id_token = Some("id-1".to_string());
        session.created_at = Utc::now() - chrono::Duration::hours(2);

        let refreshed = RefreshedTokens {
            access_token: "at-2".to_string(),
            refresh_token: None,
            id_token: Some("id-2".to_string()),
            expires_on: None,
        }
        .apply(&session);

        assert_eq!(refreshed.user, "alice");
        assert_eq!(refreshed.access_token, "at-2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(refreshed.id_token.as_deref(), Some("id-2"));
        assert!(refreshed.created_at > session.created_at);
    }

    #[test]
    fn authorization_url_carries_code_flow_params() {
        let endpoint = Url::parse("https://idp.example.com/authorize?prompt=login").unwrap();
        let url = authorization_url(&endpoint, "client", "https://app/oauth2/callback", "openid email", "n:/x");
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

        assert!(pairs.contains(&("prompt".to_string(), "login".to_string())));
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
        assert!(pairs.contains(&("redirect_uri".to_string(), "https://app/oauth2/callback".to_string())));
        assert!(pairs.contains(&("state".to_string(), "n:/x".to_string())));
    }

    #[test]
    fn missing_endpoint_is_config_error() {
        assert!(matches!(parse_endpoint("login_url", None), Err(Error::Config(_))));
        assert!(parse_endpoint("login_url", Some("not a url")).is_err());
    }
}
