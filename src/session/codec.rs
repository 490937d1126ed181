//! Session sealing.
//!
//! Wire format (URL-safe base64, no padding):
//!
//! ```text
//! body || HMAC-SHA256(body)
//! body = nonce(12) || AES-256-GCM(envelope)    when encrypting
//!      = envelope                               otherwise
//! envelope = {"v":1,"exp":<unix seconds>,"session":{..}}
//! ```
//!
//! The tag is checked before anything inside `body` is looked at, and an
//! envelope whose `exp` has passed is rejected even with a valid tag.
//!
//! The MAC and AES keys are both derived from the secret with
//! HMAC-SHA256 under distinct labels, so neither is the raw secret.

use std::fmt;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit as _};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{Session, SessionError};

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const ENVELOPE_VERSION: u8 = 1;
const KEY_LEN: usize = 32;
const MAC_LABEL: &[u8] = b"authgate session mac";
const ENC_LABEL: &[u8] = b"authgate session enc";

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    exp: i64,
    session: Session,
}

/// Seals and opens sessions with one secret.
#[derive(Clone)]
pub struct SessionCodec {
    mac_key: Option<[u8; KEY_LEN]>,
    cipher: Option<Aes256Gcm>,
    lifetime: Duration,
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec")
            .field("encrypted", &self.cipher.is_some())
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl SessionCodec {
    /// Create a codec keyed from `secret`.
    #[must_use]
    pub fn new(secret: &[u8], lifetime: Duration, encrypt: bool) -> Self {
        let cipher = if encrypt {
            derive_key(secret, ENC_LABEL).map(|key| Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&key)))
        } else {
            None
        };

        Self {
            mac_key: derive_key(secret, MAC_LABEL),
            cipher,
            lifetime,
        }
    }

    /// Lifetime stamped into every envelope.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Seal `session`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Encoding`] if serialization or encryption fails.
    pub fn encode(&self, session: &Session) -> Result<String, SessionError> {
        let exp = chrono::Duration::from_std(self.lifetime)
            .ok()
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| SessionError::Encoding(format!("Invalid lifetime: {:?}", self.lifetime)))?;
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            exp: exp.timestamp(),
            session: session.clone(),
        };
        let plaintext =
            serde_json::to_vec(&envelope).map_err(|e| SessionError::Encoding(e.to_string()))?;

        let mut body = match &self.cipher {
            Some(cipher) => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
                    .map_err(|_| SessionError::Encoding("Encryption failed".to_string()))?;
                let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                out
            }
            None => plaintext,
        };

        let tag = self.tag(&body)?;
        body.extend_from_slice(&tag);
        Ok(URL_SAFE_NO_PAD.encode(body))
    }

    /// Open a sealed session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Invalid`] for malformed input, a tag mismatch,
    /// a decryption failure or an expired envelope.
    pub fn decode(&self, sealed: &str) -> Result<Session, SessionError> {
        let raw = URL_SAFE_NO_PAD
            .decode(sealed.trim())
            .map_err(|_| SessionError::Invalid("Malformed encoding".to_string()))?;
        if raw.len() <= TAG_LEN {
            return Err(SessionError::Invalid("Payload too short".to_string()));
        }

        let (body, tag) = raw.split_at(raw.len() - TAG_LEN);
        self.mac()?
            .chain_update(body)
            .verify_slice(tag)
            .map_err(|_| SessionError::Invalid("Authentication tag mismatch".to_string()))?;

        let plaintext = match &self.cipher {
            Some(cipher) => {
                if body.len() < NONCE_LEN {
                    return Err(SessionError::Invalid("Payload too short".to_string()));
                }
                let (nonce, ciphertext) = body.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| SessionError::Invalid("Decryption failed".to_string()))?
            }
            None => body.to_vec(),
        };

        let envelope: Envelope = serde_json::from_slice(&plaintext)
            .map_err(|e| SessionError::Invalid(format!("Malformed payload: {e}")))?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(SessionError::Invalid(format!("Unknown version {}", envelope.v)));
        }
        if envelope.exp <= Utc::now().timestamp() {
            return Err(SessionError::Invalid("Session expired".to_string()));
        }

        Ok(envelope.session)
    }

    /// Sign a short cookie value: `value|timestamp|signature`.
    ///
    /// The cookie name is covered so a value cannot be moved between cookies.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Encoding`] if the MAC cannot be keyed.
    pub fn sign_value(&self, name: &str, value: &str) -> Result<String, SessionError> {
        let ts = Utc::now().timestamp();
        let sig = URL_SAFE_NO_PAD.encode(self.tag(signed_input(name, value, ts).as_bytes())?);
        Ok(format!("{value}|{ts}|{sig}"))
    }

    /// Verify a value produced by [`SessionCodec::sign_value`].
    ///
    /// Returns `None` on a bad signature or when older than the codec lifetime.
    #[must_use]
    pub fn verify_value(&self, name: &str, signed: &str) -> Option<String> {
        let mut parts = signed.rsplitn(3, '|');
        let sig = parts.next()?;
        let ts: i64 = parts.next()?.parse().ok()?;
        let value = parts.next()?;

        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;
        self.mac()
            .ok()?
            .chain_update(signed_input(name, value, ts).as_bytes())
            .verify_slice(&sig)
            .ok()?;

        let max_age = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);
        (Utc::now().timestamp().saturating_sub(ts) <= max_age).then(|| value.to_string())
    }

    fn mac(&self) -> Result<HmacSha256, SessionError> {
        let key = self
            .mac_key
            .as_ref()
            .ok_or_else(|| SessionError::Encoding("Invalid MAC key".to_string()))?;
        <HmacSha256 as KeyInit>::new_from_slice(key)
            .map_err(|e| SessionError::Encoding(format!("Invalid MAC key: {e}")))
    }

    fn tag(&self, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        Ok(self.mac()?.chain_update(body).finalize().into_bytes().to_vec())
    }
}

/// `HMAC-SHA256(secret, label)`.
fn derive_key(secret: &[u8], label: &[u8]) -> Option<[u8; KEY_LEN]> {
    let digest = <HmacSha256 as KeyInit>::new_from_slice(secret)
        .ok()?
        .chain_update(label)
        .finalize()
        .into_bytes();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..]);
    Some(key)
}

fn signed_input(name: &str, value: &str, ts: i64) -> String {
    format!("{name}|{value}|{ts}")
}
