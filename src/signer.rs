//! Outbound request signing (`GAP-Signature`).
//!
//! Proves to the upstream that a request passed through this gateway. The
//! signed fingerprint binds the method, request URI and a SHA-256 digest of
//! the body, so a captured signature cannot be replayed against a different
//! path or payload.
//!
//! Signing is opt-in: without a configured key [`RequestSigner::from_config`]
//! returns `None` and no header is produced. An empty secret is a
//! configuration error, never an HMAC with an empty key.

use std::fmt;

use axum::http::{HeaderMap, HeaderValue, Method};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, KeyInit, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::{Error, Result};

/// Header carrying `<algorithm> <base64 signature>`
pub const SIGNATURE_HEADER: &str = "gap-signature";

/// Header carrying the authenticated user, included in the signature
pub const AUTH_HEADER: &str = "gap-auth";

/// Headers folded into the signature, in order.
pub const SIGNED_HEADERS: &[&str] = &[
    "content-type",
    "date",
    "authorization",
    "x-forwarded-user",
    "x-forwarded-email",
    "x-forwarded-access-token",
    "cookie",
    "gap-auth",
];

/// HMAC hash selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// HMAC-SHA1 (legacy upstreams)
    Sha1,
    /// HMAC-SHA256
    Sha256,
    /// HMAC-SHA512
    Sha512,
}

impl SignatureAlgorithm {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        })
    }
}

/// Parsed `algorithm:secret` pair.
#[derive(Clone)]
pub struct SignatureKey {
    algorithm: SignatureAlgorithm,
    secret: String,
}

impl fmt::Debug for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureKey")
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureKey {
    /// Parse `sha256:secret`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing separator, unknown algorithm or
    /// empty secret.
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, secret) = s
            .split_once(':')
            .ok_or_else(|| Error::Config("signature_key must be 'algorithm:secret'".to_string()))?;

        let algorithm = SignatureAlgorithm::parse(alg)
            .ok_or_else(|| Error::Config(format!("Unsupported signature algorithm '{alg}'")))?;

        if secret.is_empty() {
            return Err(Error::Config("signature_key secret must not be empty".to_string()));
        }

        Ok(Self {
            algorithm,
            secret: secret.to_string(),
        })
    }

    /// The configured algorithm.
    #[must_use]
    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }
}

/// HMAC `message` with `secret` using digest `$d`, base64-encoded.
macro_rules! hmac_b64 {
    ($d:ty, $secret:expr, $message:expr) => {{
        let mut mac = Hmac::<$d>::new_from_slice($secret.as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid signature key: {e}")))?;
        mac.update($message.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }};
}

/// Signs outbound upstream requests.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    key: SignatureKey,
}

impl RequestSigner {
    /// Create a signer for a parsed key.
    #[must_use]
    pub fn new(key: SignatureKey) -> Self {
        Self { key }
    }

    /// Build from the optional config value; `None` means signing is disabled.
    ///
    /// # Errors
    ///
    /// Propagates [`SignatureKey::parse`] failures.
    pub fn from_config(signature_key: Option<&str>) -> Result<Option<Self>> {
        signature_key.map(|k| SignatureKey::parse(k).map(Self::new)).transpose()
    }

    /// Compute the signature header value for a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the HMAC cannot be keyed.
    pub fn sign(&self, method: &Method, uri: &str, headers: &HeaderMap, body: &[u8]) -> Result<HeaderValue> {
        let fingerprint = fingerprint(method, uri, headers, body);
        let signature = match self.key.algorithm {
            SignatureAlgorithm::Sha1 => hmac_b64!(sha1::Sha1, self.key.secret, fingerprint),
            SignatureAlgorithm::Sha256 => hmac_b64!(Sha256, self.key.secret, fingerprint),
            SignatureAlgorithm::Sha512 => hmac_b64!(Sha512, self.key.secret, fingerprint),
        };

        HeaderValue::from_str(&format!("{} {signature}", self.key.algorithm))
            .map_err(|e| Error::Internal(format!("Invalid signature header: {e}")))
    }

    /// Add `GAP-Signature` to `headers` for the given request.
    ///
    /// # Errors
    ///
    /// See [`RequestSigner::sign`].
    pub fn sign_headers(&self, method: &Method, uri: &str, headers: &mut HeaderMap, body: &[u8]) -> Result<()> {
        let value = self.sign(method, uri, headers, body)?;
        headers.insert(SIGNATURE_HEADER, value);
        Ok(())
    }
}

/// Canonical string covered by the signature.
fn fingerprint(method: &Method, uri: &str, headers: &HeaderMap, body: &[u8]) -> String {
    let digest = STANDARD.encode(Sha256::digest(body));

    let mut out = String::with_capacity(256);
    out.push_str(method.as_str());
    out.push('\n');
    out.push_str(uri);
    out.push('\n');
    out.push_str(&digest);
    out.push('\n');
    for name in SIGNED_HEADERS {
        let values: Vec<&str> = headers
            .get_all(*name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        out.push_str(&values.join(","));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(key: &str) -> RequestSigner {
        RequestSigner::from_config(Some(key)).unwrap().unwrap()
    }

    #[test]
    fn no_key_means_no_signer() {
        assert!(RequestSigner::from_config(None).unwrap().is_none());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(RequestSigner::from_config(Some("sha256:")).is_err());
        assert!(RequestSigner::from_config(Some("sha256")).is_err());
        assert!(RequestSigner::from_config(Some("md5:secret")).is_err());
    }

    #[test]
    fn header_carries_algorithm_and_base64() {
        let s = signer("sha256:topsecret");
        let value = s.sign(&Method::GET, "/api/items", &HeaderMap::new(), b"").unwrap();
        let value = value.to_str().unwrap();

        let (alg, sig) = value.split_once(' ').unwrap();
        assert_eq!(alg, "sha256");
        assert_eq!(STANDARD.decode(sig).unwrap().len(), 32);
    }

    #[test]
    fn signature_is_deterministic() {
        let s = signer("sha512:k");
        let a = s.sign(&Method::POST, "/x", &HeaderMap::new(), b"body").unwrap();
        let b = s.sign(&Method::POST, "/x", &HeaderMap::new(), b"body").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn path_body_and_method_are_bound() {
        let s = signer("sha256:k");
        let h = HeaderMap::new();
        let base = s.sign(&Method::POST, "/a", &h, b"one").unwrap();

        assert_ne!(base, s.sign(&Method::POST, "/b", &h, b"one").unwrap());
        assert_ne!(base, s.sign(&Method::POST, "/a", &h, b"two").unwrap());
        assert_ne!(base, s.sign(&Method::PUT, "/a", &h, b"one").unwrap());
    }

    #[test]
    fn identity_headers_are_bound() {
        let s = signer("sha1:k");
        let mut alice = HeaderMap::new();
        alice.insert("x-forwarded-user", "alice".parse().unwrap());
        let mut bob = HeaderMap::new();
        bob.insert("x-forwarded-user", "bob".parse().unwrap());

        assert_ne!(
            s.sign(&Method::GET, "/", &alice, b"").unwrap(),
            s.sign(&Method::GET, "/", &bob, b"").unwrap()
        );
    }

    #[test]
    fn sign_headers_inserts_header() {
        let s = signer("sha256:k");
        let mut h = HeaderMap::new();
        s.sign_headers(&Method::GET, "/", &mut h, b"").unwrap();
        assert!(h.get(SIGNATURE_HEADER).is_some());
    }

    #[test]
    fn debug_redacts_secret() {
        let key = SignatureKey::parse("sha256:hunter2").unwrap();
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}
