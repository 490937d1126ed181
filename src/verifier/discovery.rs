//! OpenID provider discovery and JWKS fetching.
//!
//! Both are idempotent reads done once at startup, so they are retried with
//! exponential backoff. Nothing here runs on the request path.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use jsonwebtoken::jwk::JwkSet;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Subset of `.well-known/openid-configuration` used by the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier; must equal the configured issuer URL
    pub issuer: String,
    /// Authorization endpoint
    pub authorization_endpoint: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// Userinfo endpoint
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    /// JWKS endpoint
    pub jwks_uri: String,
}

fn backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(attempts.saturating_sub(1))
}

/// Fetch `{issuer}/.well-known/openid-configuration`.
///
/// # Errors
///
/// Returns an error when every attempt fails or the advertised issuer does
/// not match `issuer`.
pub async fn discover(client: &Client, issuer: &str, attempts: usize) -> Result<ProviderMetadata> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    debug!(url = %url, "Discovering OpenID provider metadata");

    let metadata: ProviderMetadata = (|| get_json(client, &url))
        .retry(backoff(attempts))
        .notify(|e: &Error, after: Duration| {
            warn!(url = %url, error = %e, retry_in = ?after, "Provider discovery failed, retrying");
        })
        .await?;

    if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
        return Err(Error::Config(format!(
            "Discovered issuer {} does not match configured issuer {issuer}",
            metadata.issuer
        )));
    }

    Ok(metadata)
}

/// Fetch a JWKS document.
///
/// # Errors
///
/// Returns an error when every attempt fails.
pub async fn fetch_jwks(client: &Client, jwks_uri: &str, attempts: usize) -> Result<JwkSet> {
    debug!(url = %jwks_uri, "Fetching JWKS");
    (|| get_json(client, jwks_uri))
        .retry(backoff(attempts))
        .notify(|e: &Error, after: Duration| {
            warn!(url = %jwks_uri, error = %e, retry_in = ?after, "JWKS fetch failed, retrying");
        })
        .await
}

async fn get_json<T: serde::de::DeserializeOwned>(client: &Client, url: &str) -> Result<T> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Internal(format!(
            "GET {url} failed: HTTP {}",
            response.status()
        )));
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_parses_minimal_document() {
        let json = r#"{
            "issuer": "https://idp.example.com",
            "authorization_endpoint": "https://idp.example.com/auth",
            "token_endpoint": "https://idp.example.com/token",
            "jwks_uri": "https://idp.example.com/keys",
            "response_types_supported": ["code"]
        }"#;
        let metadata: ProviderMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.token_endpoint, "https://idp.example.com/token");
        assert!(metadata.userinfo_endpoint.is_none());
    }

    #[tokio::test]
    async fn unreachable_issuer_fails_after_retries() {
        let client = Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        // Port 9 (discard) on localhost is not listening in test environments
        let result = discover(&client, "http://127.0.0.1:9", 1).await;
        assert!(result.is_err());
    }
}
