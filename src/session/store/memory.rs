//! In-process ticket backend.
//!
//! Backed by a `DashMap` with lazy eviction on read and a background reaper.
//! Sessions do not survive a restart and are not shared between replicas.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::TicketBackend;
use crate::session::SessionError;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// `DashMap`-backed [`TicketBackend`].
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (possibly expired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all expired entries.
    pub fn reap_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl TicketBackend for MemoryBackend {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), SessionError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !entry.is_expired() {
            return Ok(Some(entry.value.clone()));
        }
        drop(entry);

        self.entries.remove(key);
        debug!(key = %key, "Lazy-evicted expired ticket");
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<(), SessionError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Reap expired entries every `interval` until the backend is dropped.
pub fn spawn_reaper(backend: &Arc<MemoryBackend>, interval: Duration) {
    let weak: Weak<MemoryBackend> = Arc::downgrade(backend);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(backend) = weak.upgrade() else {
                debug!("Ticket reaper shutting down");
                break;
            };
            let reaped = backend.reap_expired();
            if reaped > 0 {
                debug!(count = reaped, "Reaped expired tickets");
            }
        }
    });
}
