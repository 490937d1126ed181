//! JWT signature and claim verification.
//!
//! 1. Decode the header (no verification) to get `alg` and `kid`.
//! 2. Pick the decoding key: by `kid` from the JWKS, or the single key when
//!    the set has exactly one and the token carries no `kid`.
//! 3. Verify signature, `exp` (60s leeway), `iss` and, when audiences are
//!    configured, `aud`.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use tracing::warn;

use super::{Claims, VerifierError};

/// Clock skew tolerated on `exp`/`nbf`.
const LEEWAY_SECS: u64 = 60;

const ASYMMETRIC: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

const SYMMETRIC: &[Algorithm] = &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

enum Keys {
    /// Keys from a provider's JWKS, with their `kid`
    Jwks(Vec<(Option<String>, DecodingKey)>),
    /// Shared HMAC secret
    Secret(DecodingKey),
}

/// Verifies tokens from one issuer.
pub struct TokenVerifier {
    issuer: String,
    audiences: Vec<String>,
    keys: Keys,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = match &self.keys {
            Keys::Jwks(k) => k.len(),
            Keys::Secret(_) => 1,
        };
        f.debug_struct("TokenVerifier")
            .field("issuer", &self.issuer)
            .field("audiences", &self.audiences)
            .field("keys", &keys)
            .finish()
    }
}

impl TokenVerifier {
    /// Build from a provider's JWKS. Keys of unsupported types are skipped.
    #[must_use]
    pub fn from_jwks(issuer: impl Into<String>, audiences: Vec<String>, jwks: &JwkSet) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter_map(|jwk| {
                let key = match &jwk.algorithm {
                    AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
                    AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
                    AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
                };
                if key.is_none() {
                    warn!(kid = ?jwk.common.key_id, "Skipping unsupported JWK");
                }
                key.map(|k| (jwk.common.key_id.clone(), k))
            })
            .collect();

        Self {
            issuer: issuer.into(),
            audiences,
            keys: Keys::Jwks(keys),
        }
    }

    /// Build a verifier for HMAC-signed tokens sharing `secret`.
    #[must_use]
    pub fn from_secret(issuer: impl Into<String>, audiences: Vec<String>, secret: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            audiences,
            keys: Keys::Secret(DecodingKey::from_secret(secret)),
        }
    }

    /// The issuer this verifier accepts.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::InvalidToken`] on any signature, algorithm,
    /// issuer, audience or expiry failure.
    pub fn verify(&self, token: &str) -> Result<Claims, VerifierError> {
        let header = jsonwebtoken::decode_header(token).map_err(invalid)?;

        let (key, allowed) = match &self.keys {
            Keys::Secret(key) => (key, SYMMETRIC),
            Keys::Jwks(keys) => (select_key(keys, header.kid.as_deref())?, ASYMMETRIC),
        };
        if !allowed.contains(&header.alg) {
            return Err(VerifierError::InvalidToken(format!(
                "Algorithm {:?} not accepted",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[&self.issuer]);
        if self.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(self.audiences.as_slice());
        }

        jsonwebtoken::decode::<Claims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(invalid)
    }
}

fn select_key<'a>(keys: &'a [(Option<String>, DecodingKey)], kid: Option<&str>) -> Result<&'a DecodingKey, VerifierError> {
    match kid {
        Some(kid) => keys
            .iter()
            .find(|(k, _)| k.as_deref() == Some(kid))
            .map(|(_, key)| key)
            .ok_or_else(|| VerifierError::InvalidToken(format!("Unknown key ID: {kid}"))),
        None if keys.len() == 1 => Ok(&keys[0].1),
        None => Err(VerifierError::InvalidToken("Token has no 'kid' header".to_string())),
    }
}

fn invalid(e: jsonwebtoken::errors::Error) -> VerifierError {
    VerifierError::InvalidToken(e.to_string())
}

#[derive(Deserialize)]
struct IssuerOnly {
    #[serde(default)]
    iss: String,
}

/// Read `iss` without verifying anything, to choose a verifier.
pub(super) fn unverified_issuer(token: &str) -> Result<String, VerifierError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| VerifierError::InvalidToken("Malformed JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| VerifierError::InvalidToken("Malformed JWT payload".to_string()))?;
    let claims: IssuerOnly = serde_json::from_slice(&bytes)
        .map_err(|_| VerifierError::InvalidToken("Malformed JWT claims".to_string()))?;
    Ok(claims.iss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    const SECRET: &[u8] = b"jwt-test-secret-0123456789abcdef";

    fn sign(claims: &serde_json::Value, alg: Algorithm) -> String {
        jsonwebtoken::encode(&Header::new(alg), claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn claims(iss: &str, aud: serde_json::Value, exp_offset: i64) -> serde_json::Value {
        serde_json::json!({
            "sub": "alice",
            "iss": iss,
            "aud": aud,
            "exp": chrono::Utc::now().timestamp() + exp_offset,
            "preferred_username": "alice",
            "groups": ["admins"],
        })
    }

    fn verifier(audiences: &[&str]) -> TokenVerifier {
        TokenVerifier::from_secret(
            "https://idp.example.com",
            audiences.iter().map(ToString::to_string).collect(),
            SECRET,
        )
    }

    #[test]
    fn valid_token_yields_claims() {
        let token = sign(&claims("https://idp.example.com", "api".into(), 300), Algorithm::HS256);
        let claims = verifier(&["api"]).verify(&token).unwrap();

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.preferred_username.as_deref(), Some("alice"));
        assert_eq!(claims.groups, vec!["admins".to_string()]);
    }

    #[test]
    fn audience_array_member_is_accepted() {
        let token = sign(
            &claims("https://idp.example.com", serde_json::json!(["web", "api"]), 300),
            Algorithm::HS384,
        );
        assert!(verifier(&["api"]).verify(&token).is_ok());
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let token = sign(&claims("https://idp.example.com", "web".into(), 300), Algorithm::HS256);
        assert!(verifier(&["api"]).verify(&token).is_err());
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let token = sign(&claims("https://evil.example.com", "api".into(), 300), Algorithm::HS256);
        assert!(verifier(&["api"]).verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected_past_leeway() {
        let token = sign(&claims("https://idp.example.com", "api".into(), -600), Algorithm::HS256);
        assert!(verifier(&["api"]).verify(&token).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let token = sign(&claims("https://idp.example.com", "api".into(), 300), Algorithm::HS256);
        let mut tampered = token.into_bytes();
        let last = tampered.len() - 2;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        assert!(verifier(&["api"]).verify(&tampered).is_err());
    }

    #[test]
    fn jwks_verifier_refuses_hmac_tokens() {
        // GIVEN: a verifier built from an (empty) asymmetric key set
        let v = TokenVerifier::from_jwks("https://idp.example.com", vec![], &JwkSet { keys: vec![] });
        let token = sign(&claims("https://idp.example.com", "api".into(), 300), Algorithm::HS256);

        // THEN: no key is selected and the token is refused
        assert!(matches!(v.verify(&token), Err(VerifierError::InvalidToken(_))));
    }

    #[test]
    fn unverified_issuer_reads_payload() {
        let token = sign(&claims("https://idp.example.com", "api".into(), 300), Algorithm::HS256);
        assert_eq!(unverified_issuer(&token).unwrap(), "https://idp.example.com");
        assert!(unverified_issuer("not-a-jwt").is_err());
    }
}
