//! Shared fixtures: a scripted identity provider and a ticket backend that
//! can be made to stall or fail.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use authgate::config::Config;
use authgate::gatekeeper::Gatekeeper;
use authgate::provider::{Provider, ProviderError, RefreshedTokens};
use authgate::session::store::{MemoryBackend, TicketBackend};
use authgate::session::{CookieMutations, RequestCookies, Session, SessionError, SessionStore};
use authgate::verifier::{Claims, VerifierPool};
use chrono::Utc;
use url::Url;

/// 32-byte cookie secret
pub const COOKIE_SECRET: &str = "0123456789abcdef0123456789abcdef";

/// Authorization code [`FakeProvider`] accepts
pub const GOOD_CODE: &str = "good-code";

/// Config with a valid cookie secret and everything else defaulted.
pub fn base_config() -> Config {
    let mut config = Config::default();
    config.cookie.secret = COOKIE_SECRET.to_string();
    config.provider.client_id = "authgate".to_string();
    config.provider.issuer_url = Some("https://idp.test".to_string());
    config
}

/// Provider whose responses are scripted by the test.
#[derive(Debug, Default)]
pub struct FakeProvider {
    /// Email put on sessions from [`Provider::exchange_code`]
    pub email: String,
    /// Make refresh calls fail
    pub fail_refresh: AtomicBool,
    /// Make refresh calls hang
    pub stall_refresh: AtomicBool,
    /// Make validation calls fail
    pub fail_validate: AtomicBool,
    /// Refresh calls seen
    pub refresh_calls: AtomicUsize,
    /// Validation calls seen
    pub validate_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(email: &str) -> Arc<Self> {
        Arc::new(Self {
            email: email.to_string(),
            ..Self::default()
        })
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn id(&self) -> &str {
        "fake"
    }

    fn login_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = Url::parse("https://idp.test/authorize").unwrap();
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<Session, ProviderError> {
        if code != GOOD_CODE {
            return Err(ProviderError::ExchangeFailed("invalid_grant".to_string()));
        }
        Ok(Session {
            email: Some(self.email.clone()),
            preferred_username: Some("alice".to_string()),
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_on: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Session::new("user-1", "fake")
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_refresh.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(ProviderError::RefreshFailed(format!("{refresh_token} revoked")));
        }
        Ok(RefreshedTokens {
            access_token: "access-2".to_string(),
            refresh_token: None,
            id_token: None,
            expires_on: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn validate_token(&self, token: &str) -> Result<Claims, ProviderError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(ProviderError::InvalidToken(format!("{token} revoked")));
        }
        Ok(Claims::default())
    }
}

/// In-memory ticket backend with switchable failure modes.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    /// Every call hangs until the store timeout fires
    pub stalled: AtomicBool,
    /// `set` fails immediately
    pub fail_writes: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    async fn maybe_stall(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl TicketBackend for FlakyBackend {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), SessionError> {
        self.maybe_stall().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SessionError::StoreUnavailable("READONLY replica".to_string()));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        self.maybe_stall().await;
        self.inner.get(key).await
    }

    async fn del(&self, key: &str) -> Result<(), SessionError> {
        self.maybe_stall().await;
        self.inner.del(key).await
    }
}

/// Gatekeeper over `store` and `provider` with an empty verifier pool.
pub fn gatekeeper(config: &Config, store: Arc<dyn SessionStore>, provider: Arc<FakeProvider>) -> Gatekeeper {
    Gatekeeper::from_config(config, store, provider, Arc::new(VerifierPool::new()))
        .unwrap()
}

/// Persist `session` and return the cookies a browser would send back.
pub async fn login(store: &dyn SessionStore, session: &Session) -> RequestCookies {
    let mut mutations = CookieMutations::new();
    store
        .save(&RequestCookies::default(), session, &mut mutations)
        .await
        .unwrap();
    RequestCookies::default().apply(&mutations)
}

/// `Cookie` header value for `cookies`.
pub fn cookie_header(cookies: &RequestCookies) -> String {
    cookies
        .names()
        .filter_map(|name| cookies.get(name).map(|value| format!("{name}={value}")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Session that expired a minute ago.
pub fn expired_session(email: &str) -> Session {
    Session {
        email: Some(email.to_string()),
        access_token: "access-1".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_on: Some(Utc::now() - chrono::Duration::minutes(1)),
        ..Session::new("user-1", "fake")
    }
}

/// Session valid for another hour.
pub fn fresh_session(email: &str) -> Session {
    Session {
        expires_on: Some(Utc::now() + chrono::Duration::hours(1)),
        ..expired_session(email)
    }
}
