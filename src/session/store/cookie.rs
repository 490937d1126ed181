//! Session stored entirely in browser cookies.

use async_trait::async_trait;
use tracing::debug;

use super::SessionStore;
use crate::session::cookie::{MAX_CHUNKS, MAX_COOKIE_LEN, join_chunks, max_chunk_index, split_chunks};
use crate::session::{CookieMutations, CookieSettings, RequestCookies, Session, SessionCodec, SessionError};

/// Stateless store: the sealed session is the cookie value.
#[derive(Debug, Clone)]
pub struct CookieSessionStore {
    codec: SessionCodec,
    settings: CookieSettings,
    chunk_size: usize,
}

impl CookieSessionStore {
    /// Create a store; chunks are sized to keep every cookie under 4 KB.
    #[must_use]
    pub fn new(codec: SessionCodec, settings: CookieSettings) -> Self {
        // Leave room for the name, `_NN` suffix and `=`
        let chunk_size = MAX_COOKIE_LEN.saturating_sub(settings.name.len() + 4);
        Self {
            codec,
            settings,
            chunk_size,
        }
    }

    /// Expire chunk slots `from..=to`.
    fn expire_slots(&self, from: usize, to: Option<usize>, response: &mut CookieMutations) {
        let Some(to) = to else { return };
        for i in from..=to {
            response.push(self.settings.expire(self.settings.chunk_name(i)));
        }
    }
}

#[async_trait]
impl SessionStore for CookieSessionStore {
    async fn save(
        &self,
        request: &RequestCookies,
        session: &Session,
        response: &mut CookieMutations,
    ) -> Result<(), SessionError> {
        let sealed = self.codec.encode(session)?;
        let chunks = split_chunks(&sealed, self.chunk_size);
        if chunks.len() > MAX_CHUNKS {
            return Err(SessionError::Encoding(format!(
                "Session needs {} cookies, at most {MAX_CHUNKS} allowed",
                chunks.len()
            )));
        }

        for (i, chunk) in chunks.iter().enumerate() {
            response.push(self.settings.set(self.settings.chunk_name(i), *chunk));
        }

        // Slots the previous, larger session used and this one does not
        let previous = max_chunk_index(request, &self.settings);
        if previous.is_some_and(|max| max >= chunks.len()) {
            self.expire_slots(chunks.len(), previous, response);
        }

        debug!(user = %session.user, chunks = chunks.len(), "Saved cookie session");
        Ok(())
    }

    async fn load(&self, request: &RequestCookies) -> Result<Session, SessionError> {
        let sealed = join_chunks(request, &self.settings)
            .map_err(|missing| SessionError::Invalid(format!("Missing session cookie chunk {missing}")))?
            .ok_or(SessionError::NotFound)?;

        self.codec.decode(&sealed)
    }

    async fn clear(&self, request: &RequestCookies, response: &mut CookieMutations) -> Result<(), SessionError> {
        let max = max_chunk_index(request, &self.settings).unwrap_or(0);
        self.expire_slots(0, Some(max), response);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "cookie"
    }
}
