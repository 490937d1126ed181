//! The individual authentication strategies.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{
    AuthFailure, AuthRequest, AuthSource, BypassReason, Decision, Gatekeeper, Verdict, parse_basic_credentials,
};
use crate::session::{Session, SessionError};
use crate::verifier::Claims;

/// One step of the decision chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// CORS preflight (`OPTIONS`) bypass
    Preflight,
    /// Trusted client IP bypass
    TrustedIp,
    /// Exempt path bypass
    PathBypass,
    /// `Authorization: Bearer` JWT
    JwtBearer,
    /// Session cookie or ticket
    Session,
    /// `Authorization: Basic` against htpasswd
    BasicAuth,
}

impl Strategy {
    /// Evaluation precedence: cheap stateless bypasses first, then stateless
    /// bearer tokens, then stored sessions, then basic auth.
    pub const ORDER: [Self; 6] = [
        Self::Preflight,
        Self::TrustedIp,
        Self::PathBypass,
        Self::JwtBearer,
        Self::Session,
        Self::BasicAuth,
    ];
}

impl Gatekeeper {
    /// Run one strategy. `None` means inconclusive.
    pub(super) async fn run(&self, strategy: Strategy, request: &AuthRequest, decision: &mut Decision) -> Option<Verdict> {
        match strategy {
            Strategy::Preflight => (request.method == axum::http::Method::OPTIONS)
                .then_some(Verdict::AllowAnonymous(BypassReason::Preflight)),
            Strategy::TrustedIp => request
                .client_ip
                .is_some_and(|ip| self.trusted_ips.contains(ip))
                .then_some(Verdict::AllowAnonymous(BypassReason::TrustedIp)),
            Strategy::PathBypass => self
                .bypass
                .matches(&request.path)
                .then_some(Verdict::AllowAnonymous(BypassReason::SkipPath)),
            Strategy::JwtBearer => self.bearer(request, decision),
            Strategy::Session => self.session(request, decision).await,
            Strategy::BasicAuth => self.basic_auth(request, decision),
        }
    }

    fn bearer(&self, request: &AuthRequest, decision: &mut Decision) -> Option<Verdict> {
        let token = request.bearer_token()?;
        match self.verifiers.verify_bearer(token) {
            Ok(claims) => Some(Verdict::Allow {
                session: session_from_claims(claims, token),
                source: AuthSource::Bearer,
            }),
            Err(e) => {
                debug!(error = %e, error_kind = "invalid_token", "Bearer token rejected, falling through");
                decision.failures.push(AuthFailure::InvalidToken(e.to_string()));
                None
            }
        }
    }

    fn basic_auth(&self, request: &AuthRequest, decision: &mut Decision) -> Option<Verdict> {
        let validator = self.basic_auth.as_ref()?;
        let header = request.authorization()?;
        let (user, password) = parse_basic_credentials(header)?;

        if validator.validate(&user, &password) {
            return Some(Verdict::Allow {
                session: Session::new(user, "htpasswd"),
                source: AuthSource::BasicAuth,
            });
        }
        debug!(user = %user, error_kind = "invalid_basic_auth", "Basic auth rejected");
        decision.failures.push(AuthFailure::InvalidBasicAuth);
        None
    }

    async fn session(&self, request: &AuthRequest, decision: &mut Decision) -> Option<Verdict> {
        let session = match self.store.load(&request.cookies).await {
            Ok(session) => session,
            Err(SessionError::NotFound) => return None,
            Err(SessionError::StoreUnavailable(e)) => {
                warn!(store = self.store.kind(), error = %e, error_kind = "store_unavailable", "Session store unavailable, treating request as unauthenticated");
                decision.failures.push(AuthFailure::StoreUnavailable(e));
                return None;
            }
            Err(e) => {
                debug!(store = self.store.kind(), error = %e, error_kind = "invalid_session", "Discarding invalid session");
                decision.failures.push(AuthFailure::InvalidSession(e.to_string()));
                return None;
            }
        };

        let now = Utc::now();
        let session = if session.needs_refresh(now, self.timings.refresh_skew, self.timings.refresh_period) {
            self.refresh(request, session, decision).await?
        } else if self.needs_validation(&session, now) {
            self.revalidate(request, session, decision).await?
        } else {
            session
        };

        Some(Verdict::Allow {
            session,
            source: AuthSource::Session,
        })
    }

    /// No refresh token, and either the access token expired or the
    /// refresh period elapsed.
    fn needs_validation(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if session.has_refresh_token() {
            return false;
        }
        let period = self.timings.refresh_period;
        session.is_expired(now) || (!period.is_zero() && session.age(now) >= period)
    }

    async fn refresh(&self, request: &AuthRequest, session: Session, decision: &mut Decision) -> Option<Session> {
        let refresh_token = session.refresh_token.as_deref().unwrap_or_default();
        let result = tokio::time::timeout(self.timings.provider_timeout, self.provider.refresh(refresh_token)).await;

        let tokens = match result {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => return self.discard(request, &session, AuthFailure::RefreshFailed(e.to_string()), decision).await,
            Err(_) => {
                let reason = format!("refresh timed out after {:?}", self.timings.provider_timeout);
                return self.discard(request, &session, AuthFailure::RefreshFailed(reason), decision).await;
            }
        };

        let refreshed = tokens.apply(&session);
        self.persist(request, refreshed, decision).await
    }

    async fn revalidate(&self, request: &AuthRequest, session: Session, decision: &mut Decision) -> Option<Session> {
        let token = self.provider.session_token(&session);
        let result = tokio::time::timeout(self.timings.provider_timeout, self.provider.validate_token(token)).await;

        match result {
            Ok(Ok(_)) => {
                let revalidated = Session {
                    created_at: Utc::now(),
                    ..session
                };
                self.persist(request, revalidated, decision).await
            }
            Ok(Err(e)) => self.discard(request, &session, AuthFailure::RefreshFailed(e.to_string()), decision).await,
            Err(_) => {
                let reason = format!("validation timed out after {:?}", self.timings.provider_timeout);
                self.discard(request, &session, AuthFailure::RefreshFailed(reason), decision).await
            }
        }
    }

    /// Save a derived session over the one the request carried. A failed save
    /// discards the session for this request too.
    async fn persist(&self, request: &AuthRequest, session: Session, decision: &mut Decision) -> Option<Session> {
        match self.store.save(&request.cookies, &session, &mut decision.cookies).await {
            Ok(()) => {
                debug!(user = %session.user, "Session refreshed and saved");
                Some(session)
            }
            Err(e) => {
                warn!(user = %session.user, error = %e, error_kind = "session_save_failed", "Refreshed session could not be saved, discarding");
                decision.failures.push(AuthFailure::SessionSaveFailed(e.to_string()));
                None
            }
        }
    }

    async fn discard(
        &self,
        request: &AuthRequest,
        session: &Session,
        failure: AuthFailure,
        decision: &mut Decision,
    ) -> Option<Session> {
        warn!(user = %session.user, error = ?failure, error_kind = failure.kind(), "Session discarded");
        decision.failures.push(failure);
        if let Err(e) = self.store.clear(&request.cookies, &mut decision.cookies).await {
            warn!(error = %e, "Failed to clear discarded session");
        }
        None
    }
}

/// Identity carried by a verified bearer token.
fn session_from_claims(claims: Claims, token: &str) -> Session {
    Session {
        email: claims.email,
        preferred_username: claims.preferred_username,
        access_token: token.to_string(),
        id_token: Some(token.to_string()),
        expires_on: (claims.exp > 0)
            .then(|| DateTime::from_timestamp(claims.exp, 0))
            .flatten(),
        ..Session::new(claims.sub, claims.iss)
    }
}
