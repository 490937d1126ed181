//! Session persistence.
//!
//! The [`SessionStore`] trait abstracts over where a session lives:
//!
//! - [`CookieSessionStore`]: the sealed session itself, chunked across
//!   `_oauth2_proxy`, `_oauth2_proxy_1`, ... cookies.
//! - [`TicketSessionStore`]: the sealed session in a [`TicketBackend`]
//!   (Redis single node, Sentinel, Cluster, or process memory), with only a
//!   signed ticket in the cookie.

mod cookie;
mod memory;
mod redis;
mod ticket;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub use cookie::CookieSessionStore;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use ticket::{Ticket, TicketBackend, TicketSessionStore};

use super::{CookieMutations, CookieSettings, RequestCookies, Session, SessionCodec, SessionError};
use crate::config::{Config, SessionStoreKind};
use crate::Result;

/// Pluggable session persistence.
///
/// `save` after `load` on the same request overwrites the loaded session;
/// the superseded payload is never retrievable afterwards.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Persist `session`, queuing the cookies that reference it.
    ///
    /// `request` is consulted so the previous representation can be
    /// overwritten or cleared.
    async fn save(
        &self,
        request: &RequestCookies,
        session: &Session,
        response: &mut CookieMutations,
    ) -> std::result::Result<(), SessionError>;

    /// Materialize the session referenced by the request cookies.
    async fn load(&self, request: &RequestCookies) -> std::result::Result<Session, SessionError>;

    /// Remove the session and queue cookie removals.
    async fn clear(
        &self,
        request: &RequestCookies,
        response: &mut CookieMutations,
    ) -> std::result::Result<(), SessionError>;

    /// Short name for logs.
    fn kind(&self) -> &'static str;
}

/// Build the configured store.
///
/// # Errors
///
/// Returns an error if the Redis connection cannot be established.
pub async fn build_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    let settings = CookieSettings::from_config(&config.cookie);
    let codec = SessionCodec::new(
        config.cookie.secret.as_bytes(),
        config.cookie.expire,
        config.session.encrypt,
    );

    let store: Arc<dyn SessionStore> = match config.session.store {
        SessionStoreKind::Cookie => Arc::new(CookieSessionStore::new(codec, settings)),
        SessionStoreKind::Memory => {
            let backend = Arc::new(MemoryBackend::new());
            memory::spawn_reaper(&backend, config.session.reap_interval);
            Arc::new(TicketSessionStore::new(
                backend,
                codec,
                settings,
                String::new(),
                config.session.store_timeout,
            ))
        }
        SessionStoreKind::Redis => {
            let redis = &config.session.redis;
            let backend = RedisBackend::connect(redis).await?;
            Arc::new(TicketSessionStore::new(
                Arc::new(backend),
                codec,
                settings,
                redis.key_prefix.clone(),
                config.session.store_timeout,
            ))
        }
    };

    info!(store = store.kind(), "Session store ready");
    Ok(store)
}
