//! OAuth2 token endpoint client (authorization-code and refresh grants).

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// OIDC ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Absolute expiry derived from `expires_in`. A lifetime too large to
    /// represent is treated as no expiry.
    #[must_use]
    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .filter(|secs| *secs > 0)
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
    }
}

/// Client for one provider's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http: Client,
    url: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
}

impl TokenEndpoint {
    /// Create a client for `url`.
    #[must_use]
    pub fn new(http: Client, url: impl Into<String>, client_id: &str, client_secret: &str, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            timeout,
        }
    }

    /// `grant_type=authorization_code`.
    ///
    /// # Errors
    ///
    /// Returns a description of the transport or HTTP failure.
    pub async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<TokenResponse, String> {
        self.post(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    /// `grant_type=refresh_token`.
    ///
    /// # Errors
    ///
    /// Returns a description of the transport or HTTP failure.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, String> {
        self.post(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }

    async fn post(&self, grant: &[(&str, &str)]) -> Result<TokenResponse, String> {
        let mut params: Vec<(&str, &str)> = grant.to_vec();
        params.push(("client_id", &self.client_id));
        params.push(("client_secret", &self.client_secret));

        debug!(url = %self.url, grant = grant[0].1, "Calling token endpoint");
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| format!("Token request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status} - {body}"));
        }

        response
            .json()
            .await
            .map_err(|e| format!("Failed to parse token response: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_from_expires_in() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":3600,"token_type":"Bearer"}"#).unwrap();
        let exp = response.expires_on().unwrap();
        assert!(exp > Utc::now() + chrono::Duration::seconds(3500));
        assert!(response.refresh_token.is_none());
    }

    #[test]
    fn missing_or_zero_expires_in_has_no_expiry() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token":"at","expires_in":0}"#).unwrap();
        assert!(response.expires_on().is_none());
    }

    #[test]
    fn unrepresentable_expires_in_has_no_expiry() {
        // GIVEN: a token endpoint reporting an absurd lifetime
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":9223372036854775807}"#).unwrap();

        // THEN: no expiry instead of an overflow
        assert!(response.expires_on().is_none());

        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":9000000000000}"#).unwrap();
        assert!(response.expires_on().is_none());
    }
}
