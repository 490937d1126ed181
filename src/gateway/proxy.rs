//! Upstream forwarding.
//!
//! Requests are routed to the upstream with the longest matching path
//! prefix. The body is buffered so the request signature can cover its
//! digest; the upstream response is streamed back.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, Request, Response, header},
};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::gatekeeper::HeaderMutations;
use crate::signer::RequestSigner;
use crate::{Error, Result};

/// Largest request body forwarded upstream.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Connection-scoped headers never forwarded in either direction.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// One configured upstream.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Path prefix routed here
    pub prefix: String,
    /// Base URL
    pub url: Url,
}

/// Routes and forwards requests to upstreams.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: Client,
    upstreams: Vec<Upstream>,
    signer: Option<RequestSigner>,
    timeout: Duration,
}

impl UpstreamProxy {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed upstream URLs or signature key.
    pub fn from_config(config: &Config, client: Client) -> Result<Self> {
        let mut upstreams = config
            .upstreams
            .iter()
            .map(|u| {
                let url = Url::parse(&u.url)
                    .map_err(|e| Error::Config(format!("Invalid upstream URL {}: {e}", u.url)))?;
                Ok(Upstream {
                    prefix: u.path.clone(),
                    url,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // Longest prefix first
        upstreams.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self {
            client,
            upstreams,
            signer: RequestSigner::from_config(config.auth.signature_key.as_deref())?,
            timeout: config.server.upstream_timeout,
        })
    }

    /// Upstream with the longest prefix matching `path`.
    #[must_use]
    pub fn select(&self, path: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| path.starts_with(&u.prefix))
    }

    /// Forward `request` to `upstream` after applying identity `mutations`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] if the body cannot be read or the
    /// upstream cannot be reached.
    pub async fn forward(
        &self,
        upstream: &Upstream,
        request: Request<Body>,
        mutations: &HeaderMutations,
    ) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let target = format!("{}{path_and_query}", upstream.url.as_str().trim_end_matches('/'));

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| Error::Upstream(format!("Failed to read request body: {e}")))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        mutations.apply_to(&mut headers);
        if let Some(ref signer) = self.signer {
            signer.sign_headers(&parts.method, path_and_query, &mut headers, &body)?;
        }

        debug!(method = %parts.method, target = %target, "Forwarding upstream");
        let response = self
            .client
            .request(parts.method, &target)
            .timeout(self.timeout)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{target}: {e}")))?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut out = Response::new(Body::from_stream(response.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = response_headers;
        Ok(out)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn proxy(upstreams: &[(&str, &str)]) -> UpstreamProxy {
        let config = Config {
            upstreams: upstreams
                .iter()
                .map(|(path, url)| UpstreamConfig {
                    path: (*path).to_string(),
                    url: (*url).to_string(),
                })
                .collect(),
            ..Config::default()
        };
        UpstreamProxy::from_config(&config, Client::new()).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let p = proxy(&[("/", "http://root"), ("/api/v2", "http://v2"), ("/api", "http://api")]);
        assert_eq!(p.select("/api/v2/users").unwrap().url.as_str(), "http://v2/");
        assert_eq!(p.select("/api/users").unwrap().url.as_str(), "http://api/");
        assert_eq!(p.select("/static/x.js").unwrap().url.as_str(), "http://root/");
    }

    #[test]
    fn no_match_without_catch_all() {
        let p = proxy(&[("/api", "http://api")]);
        assert!(p.select("/other").is_none());
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::ACCEPT, "*/*".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
    }
}
