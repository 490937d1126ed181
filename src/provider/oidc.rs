//! OpenID Connect provider.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use super::{Provider, ProviderError, RefreshedTokens, TokenEndpoint, authorization_url, parse_endpoint};
use crate::config::ProviderConfig;
use crate::session::Session;
use crate::verifier::{Claims, TokenVerifier, VerifierError, VerifierPool, discovery};
use crate::{Error, Result};

/// OIDC provider: identity comes from the verified ID token.
pub struct OidcProvider {
    id: String,
    client_id: String,
    scope: String,
    authorize: Url,
    token: TokenEndpoint,
    pool: Arc<VerifierPool>,
}

impl OidcProvider {
    /// Resolve endpoints (discovery unless `skip_discovery`), fetch the JWKS
    /// and register the ID-token verifier in `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery or the JWKS fetch fails after retries,
    /// or if a required URL is missing.
    pub async fn discover(config: &ProviderConfig, client: Client, pool: Arc<VerifierPool>) -> Result<Self> {
        let issuer = config
            .issuer_url
            .clone()
            .ok_or_else(|| Error::Config("provider.issuer_url is required".to_string()))?;

        let (authorize, token_url, jwks_uri) = if config.skip_discovery {
            (
                parse_endpoint("login_url", config.login_url.as_deref())?,
                parse_endpoint("redeem_url", config.redeem_url.as_deref())?,
                parse_endpoint("jwks_url", config.jwks_url.as_deref())?.to_string(),
            )
        } else {
            let metadata = discovery::discover(&client, &issuer, config.discovery_attempts).await?;
            (
                parse_endpoint("login_url", Some(&metadata.authorization_endpoint))?,
                parse_endpoint("redeem_url", Some(&metadata.token_endpoint))?,
                metadata.jwks_uri,
            )
        };

        let jwks = discovery::fetch_jwks(&client, &jwks_uri, config.discovery_attempts).await?;
        pool.insert_provider(
            config.id.clone(),
            TokenVerifier::from_jwks(issuer.clone(), vec![config.client_id.clone()], &jwks),
        );
        info!(provider = %config.id, issuer = %issuer, keys = jwks.keys.len(), "OIDC provider ready");

        Ok(Self::new(config, authorize, token_url.to_string(), client, pool))
    }

    /// Build from resolved endpoints; the verifier must already be in `pool`.
    #[must_use]
    pub fn new(config: &ProviderConfig, authorize: Url, token_url: String, client: Client, pool: Arc<VerifierPool>) -> Self {
        Self {
            id: config.id.clone(),
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
            authorize,
            token: TokenEndpoint::new(client, token_url, &config.client_id, &config.client_secret, config.timeout),
            pool,
        }
    }

    fn verify_id_token(&self, id_token: &str) -> std::result::Result<Claims, VerifierError> {
        self.pool.verify_provider_token(&self.id, id_token)
    }
}

#[async_trait]
impl Provider for OidcProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn login_url(&self, redirect_uri: &str, state: &str) -> String {
        authorization_url(&self.authorize, &self.client_id, redirect_uri, &self.scope, state)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> std::result::Result<Session, ProviderError> {
        let tokens = self
            .token
            .exchange(code, redirect_uri)
            .await
            .map_err(ProviderError::ExchangeFailed)?;

        let id_token = tokens
            .id_token
            .clone()
            .ok_or_else(|| ProviderError::ExchangeFailed("Token response has no id_token".to_string()))?;
        let claims = self
            .verify_id_token(&id_token)
            .map_err(|e| ProviderError::ExchangeFailed(e.to_string()))?;

        debug!(provider = %self.id, sub = %claims.sub, "Exchanged authorization code");
        Ok(Session {
            email: claims.email,
            preferred_username: claims.preferred_username,
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            id_token: Some(id_token),
            expires_on: tokens.expires_on(),
            ..Session::new(claims.sub, self.id.clone())
        })
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<RefreshedTokens, ProviderError> {
        let tokens = self
            .token
            .refresh(refresh_token)
            .await
            .map_err(ProviderError::RefreshFailed)?;

        if let Some(ref id_token) = tokens.id_token {
            self.verify_id_token(id_token)
                .map_err(|e| ProviderError::RefreshFailed(format!("Refreshed ID token rejected: {e}")))?;
        }

        Ok(RefreshedTokens {
            expires_on: tokens.expires_on(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id_token: tokens.id_token,
        })
    }

    async fn validate_token(&self, token: &str) -> std::result::Result<Claims, ProviderError> {
        self.verify_id_token(token)
            .map_err(|e| ProviderError::InvalidToken(e.to_string()))
    }

    fn session_token<'a>(&self, session: &'a Session) -> &'a str {
        session.id_token.as_deref().unwrap_or(&session.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    const SECRET: &[u8] = b"oidc-provider-test-secret-012345";

    fn provider() -> OidcProvider {
        let pool = Arc::new(VerifierPool::new());
        pool.insert_provider(
            "oidc",
            TokenVerifier::from_secret("https://idp.example.com", vec!["client".into()], SECRET),
        );
        let config = ProviderConfig {
            client_id: "client".to_string(),
            ..ProviderConfig::default()
        };
        OidcProvider::new(
            &config,
            Url::parse("https://idp.example.com/authorize").unwrap(),
            "https://idp.example.com/token".to_string(),
            Client::new(),
            pool,
        )
    }

    fn id_token(aud: &str) -> String {
        let claims = serde_json::json!({
            "sub": "u-1",
            "iss": "https://idp.example.com",
            "aud": aud,
            "exp": chrono::Utc::now().timestamp() + 600,
            "email": "u1@example.com",
        });
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[tokio::test]
    async fn validates_id_tokens_through_pool() {
        let p = provider();
        let claims = p.validate_token(&id_token("client")).await.unwrap();
        assert_eq!(claims.email.as_deref(), Some("u1@example.com"));

        assert!(matches!(
            p.validate_token(&id_token("someone-else")).await,
            Err(ProviderError::InvalidToken(_))
        ));
    }

    #[test]
    fn session_token_prefers_id_token() {
        let p = provider();
        let mut session = Session::new("u-1", "oidc");
        session.access_token = "opaque".to_string();
        assert_eq!(p.session_token(&session), "opaque");

        session.id_token = Some("jwt".to_string());
        assert_eq!(p.session_token(&session), "jwt");
    }

    #[test]
    fn login_url_targets_authorize_endpoint() {
        let url = provider().login_url("https://app/oauth2/callback", "nonce:/");
        assert!(url.starts_with("https://idp.example.com/authorize?response_type=code&client_id=client"));
    }
}
