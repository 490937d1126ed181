//! Plain OAuth2 provider: explicit endpoints, identity from a profile URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{Provider, ProviderError, RefreshedTokens, TokenEndpoint, authorization_url, parse_endpoint};
use crate::config::ProviderConfig;
use crate::session::Session;
use crate::verifier::Claims;
use crate::Result;

/// Profile document returned by `profile_url`.
#[derive(Debug, Default, Deserialize)]
struct Profile {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

impl Profile {
    fn subject(&self) -> Option<String> {
        self.sub
            .clone()
            .or_else(|| {
                self.id.as_ref().map(|id| match id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            })
            .or_else(|| self.email.clone())
    }

    fn username(&self) -> Option<String> {
        self.preferred_username.clone().or_else(|| self.login.clone())
    }

    fn into_claims(self) -> Claims {
        Claims {
            sub: self.subject().unwrap_or_default(),
            preferred_username: self.username(),
            email: self.email,
            ..Claims::default()
        }
    }
}

/// Generic OAuth2 provider.
pub struct OAuth2Provider {
    id: String,
    client_id: String,
    scope: String,
    authorize: Url,
    token: TokenEndpoint,
    profile_url: Option<Url>,
    validate_url: Option<Url>,
    http: Client,
    timeout: Duration,
}

impl OAuth2Provider {
    /// Build from explicit endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] when `login_url` or `redeem_url` is
    /// missing or any configured URL is malformed.
    pub fn new(config: &ProviderConfig, client: Client) -> Result<Self> {
        let authorize = parse_endpoint("login_url", config.login_url.as_deref())?;
        let redeem = parse_endpoint("redeem_url", config.redeem_url.as_deref())?;
        let profile_url = config
            .profile_url
            .as_deref()
            .map(|u| parse_endpoint("profile_url", Some(u)))
            .transpose()?;
        let validate_url = config
            .validate_url
            .as_deref()
            .map(|u| parse_endpoint("validate_url", Some(u)))
            .transpose()?;

        Ok(Self {
            id: config.id.clone(),
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
            authorize,
            token: TokenEndpoint::new(
                client.clone(),
                redeem.to_string(),
                &config.client_id,
                &config.client_secret,
                config.timeout,
            ),
            profile_url,
            validate_url,
            http: client,
            timeout: config.timeout,
        })
    }

    async fn get_with_token(&self, url: &Url, token: &str) -> std::result::Result<reqwest::Response, String> {
        let response = self
            .http
            .get(url.clone())
            .timeout(self.timeout)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| format!("Request to {url} failed: {e}"))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(format!("{url} returned HTTP {}", response.status()))
        }
    }

    async fn profile(&self, access_token: &str) -> std::result::Result<Profile, String> {
        let Some(ref url) = self.profile_url else {
            return Ok(Profile::default());
        };
        self.get_with_token(url, access_token)
            .await?
            .json()
            .await
            .map_err(|e| format!("Failed to parse profile: {e}"))
    }
}

#[async_trait]
impl Provider for OAuth2Provider {
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
        let profile = self
            .profile(&tokens.access_token)
            .await
            .map_err(ProviderError::ExchangeFailed)?;

        let user = profile
            .subject()
            .ok_or_else(|| ProviderError::ExchangeFailed("Profile has no subject or email".to_string()))?;
        debug!(provider = %self.id, user = %user, "Exchanged authorization code");

        Ok(Session {
            preferred_username: profile.username(),
            email: profile.email,
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
            expires_on: tokens.expires_on(),
            ..Session::new(user, self.id.clone())
        })
    }

    async fn refresh(&self, refresh_token: &str) -> std::result::Result<RefreshedTokens, ProviderError> {
        let tokens = self
            .token
            .refresh(refresh_token)
            .await
            .map_err(ProviderError::RefreshFailed)?;
        Ok(RefreshedTokens {
            expires_on: tokens.expires_on(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id_token: tokens.id_token,
        })
    }

    async fn validate_token(&self, token: &str) -> std::result::Result<Claims, ProviderError> {
        if token.is_empty() {
            return Err(ProviderError::InvalidToken("empty token".to_string()));
        }

        if let Some(ref url) = self.validate_url {
            self.get_with_token(url, token)
                .await
                .map_err(ProviderError::InvalidToken)?;
            return Ok(Claims::default());
        }

        match self.profile_url {
            Some(_) => self
                .profile(token)
                .await
                .map(Profile::into_claims)
                .map_err(ProviderError::InvalidToken),
            None => Err(ProviderError::InvalidToken(
                "No validate_url or profile_url configured".to_string(),
            )),
        }
    }
}
