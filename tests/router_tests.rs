//! HTTP router tests
//!
//! Drives the axum router with `oneshot`:
//! - Health endpoint and unauthenticated redirects
//! - The full login flow (start, callback, userinfo, auth, sign out)
//! - Forwarding to a live upstream with identity headers

mod common;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, Response, StatusCode, header},
};
use pretty_assertions::assert_eq;
use reqwest::Client;
use tokio::net::TcpListener;
use tower::ServiceExt;
use url::Url;

use authgate::config::{Config, UpstreamConfig};
use authgate::gateway::{AppState, create_router};
use authgate::session::{RequestCookies, build_store};

use common::{FakeProvider, GOOD_CODE, base_config, cookie_header, fresh_session, gatekeeper, login};

async fn app(config: &Config, provider: Arc<FakeProvider>) -> (Router, Arc<AppState>) {
    let store = build_store(config).await.unwrap();
    let gk = Arc::new(gatekeeper(config, store, provider));
    let state = Arc::new(AppState::new(config, gk, Client::new()).unwrap());
    (create_router(Arc::clone(&state)), state)
}

async fn get(router: &Router, uri: &str, cookies: Option<&RequestCookies>) -> Response<Body> {
    let mut request = Request::get(uri).header(header::HOST, "gate.example.com");
    if let Some(cookies) = cookies {
        request = request.header(header::COOKIE, cookie_header(cookies));
    }
    router.clone().oneshot(request.body(Body::empty()).unwrap()).await.unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(response: &Response<Body>) -> &str {
    response.headers().get(header::LOCATION).unwrap().to_str().unwrap()
}

/// Cookies a browser keeps after `headers`, layered over `jar`.
fn keep_cookies(jar: &RequestCookies, headers: &HeaderMap) -> RequestCookies {
    let mut pairs: Vec<(String, String)> = jar
        .names()
        .filter_map(|n| jar.get(n).map(|v| (n.to_string(), v.to_string())))
        .collect();
    for set_cookie in headers.get_all(header::SET_COOKIE) {
        let raw = set_cookie.to_str().unwrap();
        let (pair, attrs) = raw.split_once(';').unwrap_or((raw, ""));
        let (name, value) = pair.split_once('=').unwrap();
        pairs.retain(|(n, _)| n != name);
        if !attrs.contains("Max-Age=0") {
            pairs.push((name.to_string(), value.to_string()));
        }
    }
    RequestCookies::from_pairs(pairs)
}

async fn spawn_upstream() -> String {
    let upstream = Router::new().fallback(|request: Request<Body>| async move {
        let user = request
            .headers()
            .get("x-forwarded-user")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        format!("{} {} user={user}", request.method(), request.uri())
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });
    format!("http://{addr}")
}

/// Test the health endpoint needs no authentication
#[tokio::test]
async fn test_ping() {
    let (router, _) = app(&base_config(), FakeProvider::new("a@example.com")).await;

    let response = get(&router, "/ping", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_text(response).await, "OK");
}

/// Test that anonymous navigation is redirected and API calls get 401
#[tokio::test]
async fn test_unauthenticated_requests() {
    let (router, _) = app(&base_config(), FakeProvider::new("a@example.com")).await;

    let response = get(&router, "/app/page?x=1", None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/oauth2/start?rd=%2Fapp%2Fpage%3Fx%3D1");

    let post = Request::post("/api/items").body(Body::from("{}")).unwrap();
    let response = router.clone().oneshot(post).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = get(&router, "/oauth2/auth", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = get(&router, "/oauth2/userinfo", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Test the complete browser login flow
#[tokio::test]
async fn test_login_flow() {
    let mut config = base_config();
    config.headers.set_xauthrequest = true;
    let (router, _) = app(&config, FakeProvider::new("alice@example.com")).await;

    // GIVEN: the browser starts a login for /dashboard
    let response = get(&router, "/oauth2/start?rd=/dashboard", None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let authorize = Url::parse(location(&response)).unwrap();
    assert_eq!(authorize.host_str(), Some("idp.test"));
    let params: std::collections::HashMap<_, _> = authorize.query_pairs().into_owned().collect();
    assert_eq!(params["redirect_uri"], "http://gate.example.com/oauth2/callback");
    let oauth_state = params["state"].clone();
    assert!(oauth_state.ends_with(":/dashboard"));
    let jar = keep_cookies(&RequestCookies::default(), response.headers());
    assert!(jar.contains("_oauth2_proxy_csrf"));

    // WHEN: the provider redirects back with a code
    let callback = format!(
        "/oauth2/callback?code={GOOD_CODE}&state={}",
        url::form_urlencoded::byte_serialize(oauth_state.as_bytes()).collect::<String>()
    );
    let response = get(&router, &callback, Some(&jar)).await;

    // THEN: the session cookie is set, CSRF cookie dropped, browser sent to rd
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/dashboard");
    let jar = keep_cookies(&jar, response.headers());
    assert!(jar.contains("_oauth2_proxy"));
    assert!(!jar.contains("_oauth2_proxy_csrf"));

    // AND: the session authenticates later requests
    let response = get(&router, "/oauth2/userinfo", Some(&jar)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let info: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(info["user"], "user-1");
    assert_eq!(info["email"], "alice@example.com");
    assert_eq!(info["preferred_username"], "alice");

    let response = get(&router, "/oauth2/auth", Some(&jar)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-auth-request-email"], "alice@example.com");

    // AND: sign out clears it
    let response = get(&router, "/oauth2/sign_out", Some(&jar)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    let jar = keep_cookies(&jar, response.headers());
    assert!(!jar.contains("_oauth2_proxy"));
}

/// Test callback failures: missing parameters, CSRF mismatch, bad code, provider error
#[tokio::test]
async fn test_callback_failures() {
    let (router, _) = app(&base_config(), FakeProvider::new("alice@example.com")).await;

    let response = get(&router, "/oauth2/callback?code=x", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&router, "/oauth2/callback?code=x&state=nonce:/", None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = get(&router, "/oauth2/callback?error=access_denied", None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A valid CSRF cookie but a code the provider rejects
    let start = get(&router, "/oauth2/start", None).await;
    let authorize = Url::parse(location(&start)).unwrap();
    let oauth_state = authorize
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let jar = keep_cookies(&RequestCookies::default(), start.headers());
    let state_param: String = url::form_urlencoded::byte_serialize(oauth_state.as_bytes()).collect();

    let response = get(&router, &format!("/oauth2/callback?code=bad&state={state_param}"), Some(&jar)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response).await.contains("Login failed"));

    // The nonce must match the cookie
    let response = get(&router, &format!("/oauth2/callback?code={GOOD_CODE}&state=other:/"), Some(&jar)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

/// Test that a login for an email outside the allow-list is refused
#[tokio::test]
async fn test_callback_refuses_disallowed_email() {
    let mut config = base_config();
    config.auth.email_domains = vec!["example.com".to_string()];
    let (router, _) = app(&config, FakeProvider::new("mallory@evil.test")).await;

    let start = get(&router, "/oauth2/start?rd=/", None).await;
    let authorize = Url::parse(location(&start)).unwrap();
    let state_param: String = authorize
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| url::form_urlencoded::byte_serialize(v.as_bytes()).collect())
        .unwrap();
    let jar = keep_cookies(&RequestCookies::default(), start.headers());

    let response = get(&router, &format!("/oauth2/callback?code={GOOD_CODE}&state={state_param}"), Some(&jar)).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let jar = keep_cookies(&jar, response.headers());
    assert!(!jar.contains("_oauth2_proxy"));
}

/// Test that off-site redirect targets are replaced with /
#[tokio::test]
async fn test_sign_out_ignores_open_redirects() {
    let (router, _) = app(&base_config(), FakeProvider::new("a@example.com")).await;

    let response = get(&router, "/oauth2/sign_out?rd=https://evil.test/", None).await;
    assert_eq!(location(&response), "/");

    let response = get(&router, "/oauth2/sign_out?rd=/bye", None).await;
    assert_eq!(location(&response), "/bye");
}

/// Test forwarding to a live upstream with injected identity headers
#[tokio::test]
async fn test_proxy_forwards_authenticated_requests() {
    // GIVEN: an upstream and a logged-in browser that also tries to spoof its identity
    let mut config = base_config();
    config.upstreams = vec![UpstreamConfig {
        path: "/".to_string(),
        url: spawn_upstream().await,
    }];
    let (router, state) = app(&config, FakeProvider::new("alice@example.com")).await;
    let jar = login(state.gatekeeper.store().as_ref(), &fresh_session("alice@example.com")).await;

    // WHEN
    let request = Request::get("/reports/42?view=full")
        .header(header::COOKIE, cookie_header(&jar))
        .header("x-forwarded-user", "admin")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    // THEN: path and query are kept, identity comes from the session
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /reports/42?view=full user=user-1");
}

/// Test stripped bypass paths reach the upstream without spoofed identity
#[tokio::test]
async fn test_proxy_strips_identity_on_bypassed_paths() {
    let mut config = base_config();
    config.auth.skip_auth_regex = vec!["^/public/".to_string()];
    config.auth.skip_auth_strip_headers = true;
    config.upstreams = vec![UpstreamConfig {
        path: "/public".to_string(),
        url: spawn_upstream().await,
    }];
    let (router, _) = app(&config, FakeProvider::new("a@example.com")).await;

    let request = Request::get("/public/logo.svg")
        .header("x-forwarded-user", "admin")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /public/logo.svg user=-");
}

/// Test that an allowed request with no matching upstream is 404
#[tokio::test]
async fn test_proxy_without_upstream_is_not_found() {
    let mut config = base_config();
    config.auth.skip_auth_regex = vec!["^/open".to_string()];
    let (router, _) = app(&config, FakeProvider::new("a@example.com")).await;

    let response = get(&router, "/open/thing", None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
