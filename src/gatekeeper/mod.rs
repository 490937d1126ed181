//! Authorization decision engine.
//!
//! For every inbound request the [`Gatekeeper`] walks an explicit, ordered
//! list of [`Strategy`] values until one yields a verdict:
//!
//! 1. CORS preflight bypass
//! 2. Trusted client IP
//! 3. Path exemption (optionally stripping identity headers)
//! 4. JWT bearer token
//! 5. Session cookie (with transparent refresh)
//! 6. htpasswd basic auth
//!
//! Nothing conclusive means [`Verdict::RedirectToLogin`]. Auth-method
//! failures never end the request on their own; they are collected in
//! [`Decision::failures`] and the chain moves on.

mod basic_auth;
mod email;
mod headers;
mod strategy;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, header};
use tracing::debug;

pub use basic_auth::{BasicAuthValidator, HtpasswdFile, parse_basic_credentials};
pub use email::EmailValidator;
pub use headers::{HeaderMutations, HeaderPolicy, UPSTREAM_IDENTITY_HEADERS};
pub use strategy::Strategy;

use crate::Result;
use crate::config::Config;
use crate::matcher::{PathBypass, TrustedIps};
use crate::provider::Provider;
use crate::session::{CookieMutations, RequestCookies, Session, SessionStore};
use crate::verifier::VerifierPool;

/// The parts of an inbound request the gatekeeper looks at.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// HTTP method
    pub method: Method,
    /// Request path (no query)
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Resolved client IP, if any
    pub client_ip: Option<IpAddr>,
    /// Parsed `Cookie` headers
    pub cookies: RequestCookies,
}

impl AuthRequest {
    /// Build from request parts; cookies are parsed from `headers`.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap, client_ip: Option<IpAddr>) -> Self {
        let cookies = RequestCookies::from_headers(&headers);
        Self {
            method,
            path: path.into(),
            headers,
            client_ip,
            cookies,
        }
    }

    fn authorization(&self) -> Option<&str> {
        self.headers.get(header::AUTHORIZATION)?.to_str().ok()
    }

    /// Token of an `Authorization: Bearer` header.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        let (scheme, token) = self.authorization()?.trim().split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
    }
}

/// How an identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    /// Session cookie or ticket
    Session,
    /// Verified JWT bearer token
    Bearer,
    /// htpasswd credentials
    BasicAuth,
}

/// Why a request skipped authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// CORS preflight
    Preflight,
    /// Client IP in the trusted set
    TrustedIp,
    /// Path matched an exemption
    SkipPath,
}

/// Why an established identity was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The identity's email is not on the allow-list
    EmailNotAllowed(String),
}

/// Terminal result of the decision chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Authenticated
    Allow {
        /// Identity to propagate
        session: Session,
        /// Strategy that established it
        source: AuthSource,
    },
    /// Unauthenticated but let through
    AllowAnonymous(BypassReason),
    /// Authenticated but refused
    Deny(DenyReason),
    /// Start the login flow
    RedirectToLogin,
}

/// A per-request auth-method failure absorbed by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Bearer token rejected, or no verifier for its issuer
    InvalidToken(String),
    /// Session cookie or payload malformed, unauthenticated or expired
    InvalidSession(String),
    /// Session backend failed or timed out
    StoreUnavailable(String),
    /// Provider refresh or validation rejected or timed out
    RefreshFailed(String),
    /// Refreshed session could not be persisted
    SessionSaveFailed(String),
    /// Basic-auth credentials presented but not accepted
    InvalidBasicAuth,
}

impl AuthFailure {
    /// Stable identifier used as the `error_kind` log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "invalid_token",
            Self::InvalidSession(_) => "invalid_session",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::RefreshFailed(_) => "refresh_failed",
            Self::SessionSaveFailed(_) => "session_save_failed",
            Self::InvalidBasicAuth => "invalid_basic_auth",
        }
    }
}

/// Verdict plus everything the transport layer must apply.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Terminal state
    pub verdict: Verdict,
    /// Edits to the request forwarded upstream
    pub upstream_headers: HeaderMutations,
    /// Headers to set on the response (auth_request mode)
    pub response_headers: HeaderMap,
    /// `Set-Cookie` edits (refreshed or cleared sessions)
    pub cookies: CookieMutations,
    /// Failures absorbed on the way to the verdict
    pub failures: Vec<AuthFailure>,
}

impl Decision {
    /// Returns `true` for `Allow` and `AllowAnonymous`.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allow { .. } | Verdict::AllowAnonymous(_))
    }

    /// The authenticated identity, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&Session> {
        match self.verdict {
            Verdict::Allow { ref session, .. } => Some(session),
            _ => None,
        }
    }

    /// Returns `true` if a failure of the given kind was absorbed.
    #[must_use]
    pub fn failed_with(&self, kind: &str) -> bool {
        self.failures.iter().any(|f| f.kind() == kind)
    }
}

/// Session refresh and validation timings.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    /// Refresh when the access token expires within this window
    pub refresh_skew: Duration,
    /// Refresh (or re-validate) sessions older than this; zero disables
    pub refresh_period: Duration,
    /// Deadline for provider refresh and validation calls
    pub provider_timeout: Duration,
}

impl SessionTimings {
    fn from_config(config: &Config) -> Self {
        Self {
            refresh_skew: config.session.refresh_skew,
            refresh_period: config.cookie.refresh,
            provider_timeout: config.session.refresh_timeout,
        }
    }
}

/// The per-request authorization engine. Shared read-only across requests.
pub struct Gatekeeper {
    strategies: Vec<Strategy>,
    trusted_ips: TrustedIps,
    bypass: PathBypass,
    verifiers: Arc<VerifierPool>,
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn Provider>,
    basic_auth: Option<Arc<dyn BasicAuthValidator>>,
    emails: EmailValidator,
    headers: HeaderPolicy,
    timings: SessionTimings,
}

impl Gatekeeper {
    /// Build from configuration and the startup-constructed collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed trust rules or unreadable htpasswd /
    /// email files.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn Provider>,
        verifiers: Arc<VerifierPool>,
    ) -> Result<Self> {
        let basic_auth = config
            .auth
            .htpasswd_file
            .as_deref()
            .map(HtpasswdFile::load)
            .transpose()?
            .map(|file| Arc::new(file) as Arc<dyn BasicAuthValidator>);

        let gatekeeper = Self {
            strategies: Vec::new(),
            trusted_ips: TrustedIps::parse(&config.auth.trusted_ips)?,
            bypass: PathBypass::compile(&config.auth.skip_auth_regex, config.auth.skip_auth_strip_headers)?,
            verifiers,
            store,
            provider,
            basic_auth,
            emails: EmailValidator::new(
                &config.auth.email_domains,
                config.auth.authenticated_emails_file.as_deref(),
            )?,
            headers: HeaderPolicy::new(config.headers.clone()),
            timings: SessionTimings::from_config(config),
        };

        Ok(gatekeeper.with_strategies(
            config.auth.skip_auth_preflight,
            config.auth.skip_jwt_bearer_tokens,
        ))
    }

    /// Replace the basic-auth validator.
    #[must_use]
    pub fn with_basic_auth(mut self, validator: Arc<dyn BasicAuthValidator>) -> Self {
        self.basic_auth = Some(validator);
        let preflight = self.strategies.contains(&Strategy::Preflight);
        let bearer = self.strategies.contains(&Strategy::JwtBearer);
        self.with_strategies(preflight, bearer)
    }

    fn with_strategies(mut self, preflight: bool, bearer: bool) -> Self {
        self.strategies = Strategy::ORDER
            .iter()
            .copied()
            .filter(|s| match s {
                Strategy::Preflight => preflight,
                Strategy::TrustedIp => !self.trusted_ips.is_empty(),
                Strategy::PathBypass | Strategy::Session => true,
                Strategy::JwtBearer => bearer,
                Strategy::BasicAuth => self.basic_auth.is_some(),
            })
            .collect();
        self
    }

    /// Strategies in evaluation order.
    #[must_use]
    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Session store used for login, refresh and sign-out.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Configured identity provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Header assembly policy.
    #[must_use]
    pub fn header_policy(&self) -> &HeaderPolicy {
        &self.headers
    }

    /// Returns `true` if the identity's email passes the allow-list.
    #[must_use]
    pub fn email_allowed(&self, session: &Session) -> bool {
        self.emails.is_allowed(session.email.as_deref().unwrap_or_default())
    }

    /// Decide `request`.
    pub async fn evaluate(&self, request: &AuthRequest) -> Decision {
        let mut decision = Decision {
            verdict: Verdict::RedirectToLogin,
            upstream_headers: HeaderMutations::new(),
            response_headers: HeaderMap::new(),
            cookies: CookieMutations::new(),
            failures: Vec::new(),
        };

        for strategy in &self.strategies {
            let Some(verdict) = self.run(*strategy, request, &mut decision).await else {
                debug!(strategy = ?strategy, path = %request.path, "Inconclusive");
                continue;
            };
            debug!(strategy = ?strategy, path = %request.path, verdict = verdict_name(&verdict), "Conclusive");
            decision.verdict = self.authorize(verdict);
            break;
        }

        match decision.verdict {
            Verdict::Allow { ref session, .. } => {
                decision.upstream_headers = self.headers.upstream(session);
                decision.response_headers = self.headers.response(session);
            }
            Verdict::AllowAnonymous(BypassReason::SkipPath) if self.bypass.strip_headers() => {
                decision.upstream_headers = self.headers.strip_all();
            }
            _ => {}
        }

        decision
    }

    /// Apply the email allow-list to provider-backed identities.
    fn authorize(&self, verdict: Verdict) -> Verdict {
        match verdict {
            Verdict::Allow { ref session, source } if source != AuthSource::BasicAuth && !self.email_allowed(session) => {
                let email = session.email.clone().unwrap_or_default();
                debug!(user = %session.user, email = %email, "Email not allowed");
                Verdict::Deny(DenyReason::EmailNotAllowed(email))
            }
            other => other,
        }
    }
}

fn verdict_name(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Allow { .. } => "allow",
        Verdict::AllowAnonymous(_) => "allow_anonymous",
        Verdict::Deny(_) => "deny",
        Verdict::RedirectToLogin => "redirect_to_login",
    }
}
