//! Token verification.
//!
//! The [`VerifierPool`] holds one [`TokenVerifier`] per identity provider and
//! one per accepted bearer issuer. It is populated once at startup from
//! provider discovery metadata and then only read on the request path, so
//! no key fetch ever happens while a request waits.

pub mod discovery;
mod jwt;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use jwt::TokenVerifier;

use crate::{Error, Result};

/// Token verification failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifierError {
    /// Signature, issuer, audience or expiry check failed
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// No verifier is registered for the provider or issuer
    #[error("No verifier available for {0}")]
    VerifierUnavailable(String),
}

/// Claims extracted from a verified token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (`sub`)
    pub sub: String,
    /// Issuer (`iss`)
    #[serde(default)]
    pub iss: String,
    /// Expiry as a Unix timestamp (`exp`)
    #[serde(default)]
    pub exp: i64,
    /// Email address
    #[serde(default)]
    pub email: Option<String>,
    /// Preferred username
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
}

/// An accepted bearer issuer with the audiences it may issue for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerIssuer {
    /// Issuer URL, matched exactly against `iss`
    pub issuer: String,
    /// Audience, matched against `aud`
    pub audience: String,
}

impl BearerIssuer {
    /// Parse an `issuer=audience` pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either side is missing.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((issuer, audience)) if !issuer.is_empty() && !audience.is_empty() => Ok(Self {
                issuer: issuer.to_string(),
                audience: audience.to_string(),
            }),
            _ => Err(Error::Config(format!(
                "Invalid extra_jwt_issuers entry '{s}', expected issuer=audience"
            ))),
        }
    }

    /// Parse every configured pair.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed pair.
    pub fn parse_all<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Self>> {
        entries.iter().map(|e| Self::parse(e.as_ref())).collect()
    }

    /// Group pairs by issuer, preserving first-seen order.
    #[must_use]
    pub fn group(pairs: &[Self]) -> Vec<(String, Vec<String>)> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for pair in pairs {
            match grouped.iter_mut().find(|(iss, _)| *iss == pair.issuer) {
                Some((_, audiences)) => audiences.push(pair.audience.clone()),
                None => grouped.push((pair.issuer.clone(), vec![pair.audience.clone()])),
            }
        }
        grouped
    }
}

/// Cache of verifiers shared by every request.
///
/// Reads take a shared lock for the duration of a map lookup only; the
/// returned `Arc` is used without holding any lock.
#[derive(Debug, Default)]
pub struct VerifierPool {
    providers: RwLock<HashMap<String, Arc<TokenVerifier>>>,
    bearer: RwLock<Vec<Arc<TokenVerifier>>>,
}

impl VerifierPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace, on key rotation) the verifier for a provider.
    pub fn insert_provider(&self, provider_id: impl Into<String>, verifier: TokenVerifier) {
        self.providers
            .write()
            .insert(provider_id.into(), Arc::new(verifier));
    }

    /// Register a bearer verifier. A verifier with the same issuer is replaced.
    pub fn insert_bearer(&self, verifier: TokenVerifier) {
        let mut bearer = self.bearer.write();
        bearer.retain(|v| v.issuer() != verifier.issuer());
        bearer.push(Arc::new(verifier));
    }

    /// Return the cached verifier for `provider_id`.
    ///
    /// Verifiers are created while the pool is populated at startup, so a
    /// miss here means discovery has not completed for that provider.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::VerifierUnavailable`] on a miss.
    pub fn get_or_create(&self, provider_id: &str) -> std::result::Result<Arc<TokenVerifier>, VerifierError> {
        self.providers
            .read()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| VerifierError::VerifierUnavailable(provider_id.to_string()))
    }

    /// Verify an ID token with the verifier registered for `provider_id`.
    ///
    /// # Errors
    ///
    /// See [`VerifierPool::get_or_create`] and [`TokenVerifier::verify`].
    pub fn verify_provider_token(&self, provider_id: &str, token: &str) -> std::result::Result<Claims, VerifierError> {
        self.get_or_create(provider_id)?.verify(token)
    }

    /// Verify a bearer token against the verifier for its (unverified) issuer.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::VerifierUnavailable`] when no verifier accepts
    /// the claimed issuer, [`VerifierError::InvalidToken`] otherwise.
    pub fn verify_bearer(&self, token: &str) -> std::result::Result<Claims, VerifierError> {
        let issuer = jwt::unverified_issuer(token)?;
        let verifier = self
            .bearer
            .read()
            .iter()
            .find(|v| v.issuer() == issuer)
            .cloned()
            .ok_or_else(|| VerifierError::VerifierUnavailable(issuer.clone()))?;

        let claims = verifier.verify(token)?;
        debug!(issuer = %issuer, sub = %claims.sub, "Bearer token verified");
        Ok(claims)
    }

    /// Returns `true` if at least one bearer issuer is registered.
    #[must_use]
    pub fn has_bearer_verifiers(&self) -> bool {
        !self.bearer.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    const SECRET: &[u8] = b"pool-test-secret-0123456789abcdef";

    fn token(iss: &str, aud: &str, exp_offset: i64) -> String {
        let claims = serde_json::json!({
            "sub": "user-1",
            "iss": iss,
            "aud": aud,
            "exp": chrono::Utc::now().timestamp() + exp_offset,
            "email": "user@example.com",
        });
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[test]
    fn parses_issuer_audience_pairs() {
        let pairs = BearerIssuer::parse_all(&["https://a=api", "https://a=web", "https://b=api"]).unwrap();
        assert_eq!(pairs[0].issuer, "https://a");
        assert_eq!(pairs[1].audience, "web");

        let grouped = BearerIssuer::group(&pairs);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].1, vec!["api".to_string(), "web".to_string()]);
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(BearerIssuer::parse("https://a").is_err());
        assert!(BearerIssuer::parse("=aud").is_err());
        assert!(BearerIssuer::parse("iss=").is_err());
    }

    #[test]
    fn missing_provider_is_unavailable() {
        let pool = VerifierPool::new();
        assert!(matches!(
            pool.get_or_create("oidc"),
            Err(VerifierError::VerifierUnavailable(_))
        ));
    }

    #[test]
    fn bearer_selected_by_issuer() {
        // GIVEN: a pool with one bearer issuer
        let pool = VerifierPool::new();
        pool.insert_bearer(TokenVerifier::from_secret("https://idp", vec!["api".into()], SECRET));

        // THEN: its tokens verify, other issuers are unavailable
        let claims = pool.verify_bearer(&token("https://idp", "api", 300)).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(matches!(
            pool.verify_bearer(&token("https://other", "api", 300)),
            Err(VerifierError::VerifierUnavailable(_))
        ));
    }

    #[test]
    fn expired_bearer_is_invalid() {
        let pool = VerifierPool::new();
        pool.insert_bearer(TokenVerifier::from_secret("https://idp", vec!["api".into()], SECRET));

        assert!(matches!(
            pool.verify_bearer(&token("https://idp", "api", -3600)),
            Err(VerifierError::InvalidToken(_))
        ));
    }

    #[test]
    fn provider_verifier_replaced_on_rotation() {
        let pool = VerifierPool::new();
        pool.insert_provider("oidc", TokenVerifier::from_secret("https://idp", vec![], b"old-secret"));
        pool.insert_provider("oidc", TokenVerifier::from_secret("https://idp", vec![], SECRET));

        let claims = pool.verify_provider_token("oidc", &token("https://idp", "any", 300)).unwrap();
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }
}
