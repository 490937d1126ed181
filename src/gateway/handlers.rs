//! Request handlers: login flow, auth_request mode and the proxy fallback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use super::router::AppState;
use crate::Error;
use crate::gatekeeper::{AuthRequest, Decision, Verdict};
use crate::session::{CookieMutations, RequestCookies};

/// Lifetime of the login CSRF cookie.
pub(super) const CSRF_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Deserialize)]
pub(super) struct RedirectParams {
    rd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// `GET {ping_path}`
pub(super) async fn ping() -> &'static str {
    "OK"
}

/// `GET {prefix}/start`: set the CSRF cookie and send the browser to the provider.
pub(super) async fn start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RedirectParams>,
    headers: HeaderMap,
) -> Response {
    let rd = safe_redirect(params.rd.as_deref(), &state.server.whitelist_domains);
    let nonce = hex::encode(rand::random::<[u8; 16]>());
    let csrf_name = state.cookies.csrf_name();

    let signed = match state.csrf.sign_value(&csrf_name, &nonce) {
        Ok(signed) => signed,
        Err(e) => return error_response(&Error::from(e)),
    };
    let mut cookies = CookieMutations::new();
    cookies.push(state.cookies.set_for(csrf_name, signed, CSRF_TTL));

    let login_url = state
        .gatekeeper
        .provider()
        .login_url(&redirect_uri(&state, &headers), &format!("{nonce}:{rd}"));
    debug!(rd = %rd, "Starting login");
    found(&login_url, &cookies)
}

/// `GET {prefix}/callback`: check CSRF, exchange the code, persist the session.
pub(super) async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    if let Some(error) = params.error {
        warn!(error = %error, "Provider returned an error to the callback");
        return login_error(StatusCode::FORBIDDEN, "provider denied the login");
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return login_error(StatusCode::BAD_REQUEST, "missing code or state");
    };

    let request_cookies = RequestCookies::from_headers(&headers);
    let Some(rd) = verify_csrf(&state, &request_cookies, &oauth_state) else {
        warn!("CSRF check failed on login callback");
        return login_error(StatusCode::FORBIDDEN, "CSRF check failed");
    };

    let mut cookies = CookieMutations::new();
    cookies.push(state.cookies.expire(state.cookies.csrf_name()));

    let gatekeeper = &state.gatekeeper;
    let session = match gatekeeper
        .provider()
        .exchange_code(&code, &redirect_uri(&state, &headers))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, error_kind = "exchange_failed", "Code exchange failed");
            return login_error(Error::from(e).status_code(), "code exchange failed");
        }
    };

    if !gatekeeper.email_allowed(&session) {
        warn!(user = %session.user, email = ?session.email, "Login refused, email not allowed");
        return login_error(StatusCode::FORBIDDEN, "email not allowed");
    }

    let store = gatekeeper.store();
    if let Err(e) = store.clear(&request_cookies, &mut cookies).await {
        warn!(error = %e, "Failed to clear previous session");
    }
    // Fresh login: never reuse the previous ticket
    if let Err(e) = store.save(&RequestCookies::default(), &session, &mut cookies).await {
        let err = Error::from(e);
        warn!(error = %err, "Failed to save new session");
        return error_response(&err);
    }

    info!(user = %session.user, provider = %session.provider_id, "Login succeeded");
    found(&safe_redirect(Some(rd), &state.server.whitelist_domains), &cookies)
}

/// `GET|POST {prefix}/sign_out`
pub(super) async fn sign_out(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RedirectParams>,
    headers: HeaderMap,
) -> Response {
    let request_cookies = RequestCookies::from_headers(&headers);
    let mut cookies = CookieMutations::new();
    if let Err(e) = state.gatekeeper.store().clear(&request_cookies, &mut cookies).await {
        warn!(error = %e, "Failed to clear session on sign out");
    }
    found(&safe_redirect(params.rd.as_deref(), &state.server.whitelist_domains), &cookies)
}

/// `GET {prefix}/auth`: 202 when authorized, for `auth_request` setups.
pub(super) async fn auth(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let auth_request = auth_request(&state, &request);
    let decision = state.gatekeeper.evaluate(&auth_request).await;
    let status = match decision.verdict {
        Verdict::Allow { .. } | Verdict::AllowAnonymous(_) => StatusCode::ACCEPTED,
        Verdict::Deny(_) => StatusCode::FORBIDDEN,
        Verdict::RedirectToLogin => StatusCode::UNAUTHORIZED,
    };

    let mut response = status.into_response();
    response.headers_mut().extend(decision.response_headers);
    decision.cookies.apply_to(response.headers_mut());
    response
}

/// `GET {prefix}/userinfo`
pub(super) async fn userinfo(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let auth_request = auth_request(&state, &request);
    let decision = state.gatekeeper.evaluate(&auth_request).await;
    let mut response = match decision.identity() {
        Some(session) => Json(json!({
            "user": session.user,
            "email": session.email,
            "preferred_username": session.preferred_username,
        }))
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    };
    decision.cookies.apply_to(response.headers_mut());
    response
}

/// Everything else: authorize, then forward upstream.
pub(super) async fn proxy(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let auth_request = auth_request(&state, &request);
    let decision = state.gatekeeper.evaluate(&auth_request).await;

    let mut response = match decision.verdict {
        Verdict::Allow { .. } | Verdict::AllowAnonymous(_) => forward(&state, request, &decision).await,
        Verdict::Deny(ref reason) => {
            debug!(reason = ?reason, path = %request.uri().path(), "Denied");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        Verdict::RedirectToLogin if is_navigation(request.method()) => {
            let rd = request.uri().path_and_query().map_or("/", |pq| pq.as_str());
            let rd: String = url::form_urlencoded::byte_serialize(rd.as_bytes()).collect();
            found(&format!("{}?rd={rd}", state.endpoint("/start")), &CookieMutations::new())
        }
        Verdict::RedirectToLogin => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    };

    decision.cookies.apply_to(response.headers_mut());
    response
}

async fn forward(state: &AppState, request: Request<Body>, decision: &Decision) -> Response {
    let Some(upstream) = state.proxy.select(request.uri().path()) else {
        debug!(path = %request.uri().path(), "No upstream for path");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    match state.proxy.forward(upstream, request, &decision.upstream_headers).await {
        Ok(response) => response,
        Err(e) => {
            warn!(upstream = %upstream.url, error = %e, "Upstream request failed");
            error_response(&e)
        }
    }
}

/// The body is not `Sync`, so handlers hold only this owned view of the
/// request across the gatekeeper await.
fn auth_request(state: &AppState, request: &Request<Body>) -> AuthRequest {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = state.client_ip.resolve(request.headers(), peer);

    AuthRequest::new(
        request.method().clone(),
        request.uri().path(),
        request.headers().clone(),
        client_ip,
    )
}

fn is_navigation(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// `rd` from the state parameter, when the CSRF cookie vouches for its nonce.
fn verify_csrf<'a>(state: &AppState, cookies: &RequestCookies, oauth_state: &'a str) -> Option<&'a str> {
    let (nonce, rd) = oauth_state.split_once(':')?;
    let csrf_name = state.cookies.csrf_name();
    let expected = state.csrf.verify_value(&csrf_name, cookies.get(&csrf_name)?)?;
    bool::from(expected.as_bytes().ct_eq(nonce.as_bytes())).then_some(rd)
}

fn redirect_uri(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(ref url) = state.server.redirect_url {
        return url.clone();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|_| state.server.reverse_proxy)
        .unwrap_or("http");
    format!("{proto}://{host}{}", state.endpoint("/callback"))
}

/// Post-login redirect target: a local path, or an absolute URL whose host
/// is whitelisted (`.example.com` also allows subdomains). Anything else
/// becomes `/`.
pub(crate) fn safe_redirect(rd: Option<&str>, whitelist: &[String]) -> String {
    let Some(rd) = rd.map(str::trim).filter(|rd| !rd.is_empty()) else {
        return "/".to_string();
    };

    if rd.starts_with('/') {
        let local = !rd.starts_with("//") && !rd.starts_with("/\\");
        return if local { rd.to_string() } else { "/".to_string() };
    }

    let allowed = Url::parse(rd).ok().is_some_and(|url| {
        matches!(url.scheme(), "http" | "https")
            && url.host_str().is_some_and(|host| {
                whitelist.iter().any(|domain| match domain.strip_prefix('.') {
                    Some(parent) => host == parent || host.ends_with(domain.as_str()),
                    None => host == domain,
                })
            })
    });
    if allowed { rd.to_string() } else { "/".to_string() }
}

fn found(location: &str, cookies: &CookieMutations) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    cookies.apply_to(response.headers_mut());
    response
}

fn login_error(status: StatusCode, reason: &str) -> Response {
    (status, format!("Login failed: {reason}")).into_response()
}

fn error_response(error: &Error) -> Response {
    let status = error.status_code();
    (status, status.canonical_reason().unwrap_or("Error")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Vec<String> {
        vec!["app.example.com".to_string(), ".corp.test".to_string()]
    }

    #[test]
    fn local_paths_are_kept() {
        assert_eq!(safe_redirect(Some("/dashboard?tab=1"), &[]), "/dashboard?tab=1");
        assert_eq!(safe_redirect(None, &[]), "/");
        assert_eq!(safe_redirect(Some("  "), &[]), "/");
    }

    #[test]
    fn protocol_relative_and_backslash_paths_are_rejected() {
        assert_eq!(safe_redirect(Some("//evil.test/x"), &whitelist()), "/");
        assert_eq!(safe_redirect(Some("/\\evil.test"), &whitelist()), "/");
    }

    #[test]
    fn absolute_urls_need_a_whitelisted_host() {
        let wl = whitelist();
        assert_eq!(safe_redirect(Some("https://app.example.com/x"), &wl), "https://app.example.com/x");
        assert_eq!(safe_redirect(Some("https://eu.corp.test/"), &wl), "https://eu.corp.test/");
        assert_eq!(safe_redirect(Some("https://corp.test/"), &wl), "https://corp.test/");
        assert_eq!(safe_redirect(Some("https://evilcorp.test/"), &wl), "/");
        assert_eq!(safe_redirect(Some("https://other.example.com/"), &wl), "/");
        assert_eq!(safe_redirect(Some("javascript:alert(1)"), &wl), "/");
    }
}
