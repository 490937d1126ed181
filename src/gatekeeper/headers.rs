//! Identity header assembly.
//!
//! [`HeaderPolicy`] turns an authenticated [`Session`] into the headers sent
//! upstream and the headers set on the response. Every header is toggled by
//! its own flag in [`HeaderConfig`]; assembly has no side effects.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::config::HeaderConfig;
use crate::session::Session;
use crate::signer::AUTH_HEADER;

/// `X-Forwarded-User`
pub const X_FORWARDED_USER: &str = "x-forwarded-user";
/// `X-Forwarded-Email`
pub const X_FORWARDED_EMAIL: &str = "x-forwarded-email";
/// `X-Forwarded-Preferred-Username`
pub const X_FORWARDED_PREFERRED_USERNAME: &str = "x-forwarded-preferred-username";
/// `X-Forwarded-Access-Token`
pub const X_FORWARDED_ACCESS_TOKEN: &str = "x-forwarded-access-token";
/// `X-Auth-Request-User`
pub const X_AUTH_REQUEST_USER: &str = "x-auth-request-user";
/// `X-Auth-Request-Email`
pub const X_AUTH_REQUEST_EMAIL: &str = "x-auth-request-email";
/// `X-Auth-Request-Preferred-Username`
pub const X_AUTH_REQUEST_PREFERRED_USERNAME: &str = "x-auth-request-preferred-username";
/// `X-Auth-Request-Access-Token`
pub const X_AUTH_REQUEST_ACCESS_TOKEN: &str = "x-auth-request-access-token";

/// Headers this gateway injects upstream; removed from inbound requests
/// before injection so clients cannot spoof them.
pub const UPSTREAM_IDENTITY_HEADERS: &[&str] = &[
    X_FORWARDED_USER,
    X_FORWARDED_EMAIL,
    X_FORWARDED_PREFERRED_USERNAME,
    X_FORWARDED_ACCESS_TOKEN,
    AUTH_HEADER,
];

/// Ordered header edits for the upstream request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMutations {
    remove: Vec<HeaderName>,
    set: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderMutations {
    /// No edits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue removal of `name`.
    pub fn remove(&mut self, name: HeaderName) {
        self.remove.push(name);
    }

    /// Queue `name: value`, replacing any inbound value.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        self.remove.push(name.clone());
        self.set.push((name, value));
    }

    /// Value queued for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.set.iter().rev().find(|(n, _)| n.as_str() == name).map(|(_, v)| v)
    }

    /// Whether `name` is queued for removal.
    #[must_use]
    pub fn removes(&self, name: &str) -> bool {
        self.remove.iter().any(|n| n.as_str() == name)
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.set.is_empty()
    }

    /// Apply removals, then insertions.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Header flags resolved for assembly.
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    config: HeaderConfig,
}

impl HeaderPolicy {
    /// Wrap the configured flags.
    #[must_use]
    pub fn new(config: HeaderConfig) -> Self {
        Self { config }
    }

    fn user<'a>(&self, session: &'a Session) -> &'a str {
        match session.email {
            Some(ref email) if self.config.prefer_email_to_user => email,
            _ => &session.user,
        }
    }

    /// Removal of every injectable identity header, for stripped bypasses.
    #[must_use]
    pub fn strip_all(&self) -> HeaderMutations {
        let mut out = HeaderMutations::new();
        for name in UPSTREAM_IDENTITY_HEADERS {
            out.remove(HeaderName::from_static(name));
        }
        if self.config.pass_basic_auth || self.config.pass_authorization_header {
            out.remove(header::AUTHORIZATION);
        }
        out
    }

    /// Headers injected upstream for `session`.
    #[must_use]
    pub fn upstream(&self, session: &Session) -> HeaderMutations {
        let mut out = self.strip_all();
        let user = self.user(session);

        if self.config.pass_basic_auth {
            let password = self.config.basic_auth_password.as_deref().unwrap_or_default();
            put(&mut out, header::AUTHORIZATION, Some(&basic(user, password)));
        }
        if self.config.pass_basic_auth || self.config.pass_user_headers {
            put(&mut out, HeaderName::from_static(X_FORWARDED_USER), Some(user));
            put(&mut out, HeaderName::from_static(X_FORWARDED_EMAIL), session.email.as_deref());
            put(
                &mut out,
                HeaderName::from_static(X_FORWARDED_PREFERRED_USERNAME),
                session.preferred_username.as_deref(),
            );
        }
        if self.config.pass_access_token {
            put(
                &mut out,
                HeaderName::from_static(X_FORWARDED_ACCESS_TOKEN),
                non_empty(&session.access_token),
            );
        }
        if self.config.pass_authorization_header {
            if let Some(ref id_token) = session.id_token {
                put(&mut out, header::AUTHORIZATION, Some(&format!("Bearer {id_token}")));
            }
        }
        put(&mut out, HeaderName::from_static(AUTH_HEADER), Some(user));

        out
    }

    /// Headers set on the response (auth_request mode) for `session`.
    #[must_use]
    pub fn response(&self, session: &Session) -> HeaderMap {
        let mut out = HeaderMutations::new();
        let user = self.user(session);

        if self.config.set_xauthrequest {
            put(&mut out, HeaderName::from_static(X_AUTH_REQUEST_USER), Some(user));
            put(&mut out, HeaderName::from_static(X_AUTH_REQUEST_EMAIL), session.email.as_deref());
            put(
                &mut out,
                HeaderName::from_static(X_AUTH_REQUEST_PREFERRED_USERNAME),
                session.preferred_username.as_deref(),
            );
            if self.config.pass_access_token {
                put(
                    &mut out,
                    HeaderName::from_static(X_AUTH_REQUEST_ACCESS_TOKEN),
                    non_empty(&session.access_token),
                );
            }
        }
        if self.config.set_basic_auth {
            let password = self.config.basic_auth_password.as_deref().unwrap_or_default();
            put(&mut out, header::AUTHORIZATION, Some(&basic(user, password)));
        }
        if self.config.set_authorization_header {
            if let Some(ref id_token) = session.id_token {
                put(&mut out, header::AUTHORIZATION, Some(&format!("Bearer {id_token}")));
            }
        }

        let mut headers = HeaderMap::new();
        out.apply_to(&mut headers);
        headers
    }
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Values that are not valid header text are skipped.
fn put(out: &mut HeaderMutations, name: HeaderName, value: Option<&str>) {
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
        out.set(name, value);
    }
}
