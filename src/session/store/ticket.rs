//! Server-side sessions referenced by a ticket cookie.
//!
//! A ticket is `<id>.<secret>`. The backend key is derived from the id only;
//! the stored value is sealed with a codec keyed by the secret, so reading
//! the backend alone is not enough to open a session. The ticket travels to
//! the browser signed with the process cookie secret.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use tracing::debug;

use super::SessionStore;
use crate::session::{CookieMutations, CookieSettings, RequestCookies, Session, SessionCodec, SessionError};

/// Key-value backend holding sealed sessions.
#[async_trait]
pub trait TicketBackend: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), SessionError>;

    /// Fetch the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;

    /// Delete `key`.
    async fn del(&self, key: &str) -> Result<(), SessionError>;
}

/// Random session reference.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket {
    id: String,
    secret: String,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Ticket {
    /// Mint a ticket: 16 random bytes of id, 32 of secret.
    #[must_use]
    pub fn generate() -> Self {
        let id: [u8; 16] = rand::random();
        let secret: [u8; 32] = rand::random();
        Self {
            id: hex::encode(id),
            secret: URL_SAFE_NO_PAD.encode(secret),
        }
    }

    /// Parse `<id>.<secret>`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (id, secret) = s.split_once('.')?;
        let valid_id = id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit());
        let valid_secret = URL_SAFE_NO_PAD.decode(secret).is_ok_and(|b| b.len() == 32);
        (valid_id && valid_secret).then(|| Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backend key: `<prefix><cookie name>-<id>`.
    #[must_use]
    pub fn key(&self, prefix: &str, cookie_name: &str) -> String {
        format!("{prefix}{cookie_name}-{}", self.id)
    }

    /// Cookie representation.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    fn codec(&self, lifetime: Duration) -> SessionCodec {
        SessionCodec::new(self.secret.as_bytes(), lifetime, true)
    }
}

/// Store persisting sessions in a [`TicketBackend`].
pub struct TicketSessionStore {
    backend: Arc<dyn TicketBackend>,
    cookie_codec: SessionCodec,
    settings: CookieSettings,
    key_prefix: String,
    timeout: Duration,
}

impl fmt::Debug for TicketSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketSessionStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TicketSessionStore {
    /// Create a store. Every backend call is bounded by `timeout`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn TicketBackend>,
        cookie_codec: SessionCodec,
        settings: CookieSettings,
        key_prefix: String,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            cookie_codec,
            settings,
            key_prefix,
            timeout,
        }
    }

    /// Ticket from the request cookie, if present and correctly signed.
    fn ticket(&self, request: &RequestCookies) -> Result<Ticket, SessionError> {
        let raw = request.get(&self.settings.name).ok_or(SessionError::NotFound)?;
        let value = self
            .cookie_codec
            .verify_value(&self.settings.name, raw)
            .ok_or_else(|| SessionError::Invalid("Ticket signature mismatch".to_string()))?;
        Ticket::parse(&value).ok_or_else(|| SessionError::Invalid("Malformed ticket".to_string()))
    }

    fn key(&self, ticket: &Ticket) -> String {
        ticket.key(&self.key_prefix, &self.settings.name)
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T, SessionError>>) -> Result<T, SessionError> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            SessionError::StoreUnavailable(format!("{op} timed out after {:?}", self.timeout))
        })?
    }
}

#[async_trait]
impl SessionStore for TicketSessionStore {
    async fn save(
        &self,
        request: &RequestCookies,
        session: &Session,
        response: &mut CookieMutations,
    ) -> Result<(), SessionError> {
        // Reuse the current ticket so the write overwrites the old payload
        let ticket = self.ticket(request).unwrap_or_else(|_| Ticket::generate());
        let lifetime = self.cookie_codec.lifetime();
        let sealed = ticket.codec(lifetime).encode(session)?;

        let key = self.key(&ticket);
        self.bounded("SET", self.backend.set(&key, sealed, lifetime)).await?;

        let signed = self.cookie_codec.sign_value(&self.settings.name, &ticket.encode())?;
        response.push(self.settings.set(self.settings.name.clone(), signed));

        debug!(ticket = %ticket.id(), user = %session.user, "Saved session ticket");
        Ok(())
    }

    async fn load(&self, request: &RequestCookies) -> Result<Session, SessionError> {
        let ticket = self.ticket(request)?;
        let key = self.key(&ticket);

        let sealed = self
            .bounded("GET", self.backend.get(&key))
            .await?
            .ok_or(SessionError::NotFound)?;

        ticket.codec(self.cookie_codec.lifetime()).decode(&sealed)
    }

    async fn clear(&self, request: &RequestCookies, response: &mut CookieMutations) -> Result<(), SessionError> {
        response.push(self.settings.expire(self.settings.name.clone()));

        match self.ticket(request) {
            Ok(ticket) => {
                let key = self.key(&ticket);
                self.bounded("DEL", self.backend.del(&key)).await
            }
            Err(_) => Ok(()),
        }
    }

    fn kind(&self) -> &'static str {
        "ticket"
    }
}
