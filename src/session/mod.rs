//! Sessions: the identity state carried between requests.
//!
//! A [`Session`] is produced by a provider code exchange, sealed by the
//! [`SessionCodec`] and persisted by a [`SessionStore`]. The gatekeeper loads
//! it on every request and refreshes it before it goes stale.

mod codec;
pub mod cookie;
pub mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use codec::SessionCodec;
pub use cookie::{CookieMutations, CookieSettings, RequestCookies, SetCookie};
pub use store::{SessionStore, build_store};

/// Session codec and store failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The request carries no session
    #[error("No session")]
    NotFound,

    /// Malformed, unauthenticated or expired payload
    #[error("Invalid session: {0}")]
    Invalid(String),

    /// The session could not be serialized or sealed
    #[error("Session encoding failed: {0}")]
    Encoding(String),

    /// The session backend failed or timed out
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Authenticated identity for one user-agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Subject identifier
    pub user: String,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Preferred username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Identifier of the provider that issued the tokens
    pub provider_id: String,
    /// Opaque access token
    #[serde(default)]
    pub access_token: String,
    /// Refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// OIDC ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// When the session was created or last refreshed
    pub created_at: DateTime<Utc>,
    /// Access token expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,
}

impl Session {
    /// Minimal session for `user`, created now.
    #[must_use]
    pub fn new(user: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            email: None,
            preferred_username: None,
            provider_id: provider_id.into(),
            access_token: String::new(),
            refresh_token: None,
            id_token: None,
            created_at: Utc::now(),
            expires_on: None,
        }
    }

    /// Returns `true` once the access token expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_some_and(|exp| exp <= now)
    }

    /// Time since creation or the last refresh.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether a refresh should be attempted before use.
    ///
    /// True when a refresh token is present and either the access token
    /// expires within `skew`, or the session is older than `refresh_period`
    /// (zero disables the age check).
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration, refresh_period: Duration) -> bool {
        if !self.has_refresh_token() {
            return false;
        }

        let expiring = self.expires_on.is_some_and(|exp| {
            chrono::Duration::from_std(skew)
                .ok()
                .and_then(|skew| exp.checked_sub_signed(skew))
                .is_some_and(|due| due <= now)
        });
        let aged = !refresh_period.is_zero() && self.age(now) >= refresh_period;

        expiring || aged
    }

    /// Returns `true` if a non-empty refresh token is present.
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_in: i64, refresh: bool) -> Session {
        let now = Utc::now();
        Session {
            refresh_token: refresh.then(|| "rt".to_string()),
            expires_on: Some(now + chrono::Duration::seconds(expires_in)),
            ..Session::new("alice", "oidc")
        }
    }

    #[test]
    fn fresh_session_needs_no_refresh() {
        let s = session(3600, true);
        assert!(!s.needs_refresh(Utc::now(), Duration::from_secs(60), Duration::ZERO));
        assert!(!s.is_expired(Utc::now()));
    }

    #[test]
    fn imminent_expiry_triggers_refresh() {
        // GIVEN: token expiring in 30s with a 60s skew window
        let s = session(30, true);

        // THEN: refresh is due
        assert!(s.needs_refresh(Utc::now(), Duration::from_secs(60), Duration::ZERO));
    }

    #[test]
    fn expired_without_refresh_token_is_not_refreshable() {
        let s = session(-10, false);
        assert!(s.is_expired(Utc::now()));
        assert!(!s.needs_refresh(Utc::now(), Duration::from_secs(60), Duration::ZERO));
    }

    #[test]
    fn refresh_period_triggers_refresh_on_age() {
        let mut s = session(3600, true);
        s.created_at = Utc::now() - chrono::Duration::minutes(10);

        assert!(s.needs_refresh(Utc::now(), Duration::from_secs(60), Duration::from_secs(300)));
        assert!(!s.needs_refresh(Utc::now(), Duration::from_secs(60), Duration::from_secs(3600)));
    }

    #[test]
    fn empty_refresh_token_counts_as_absent() {
        let mut s = session(-10, true);
        s.refresh_token = Some(String::new());
        assert!(!s.has_refresh_token());
    }
}
