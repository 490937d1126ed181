//! Redis ticket backend: single node, Sentinel-monitored, or Cluster.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo, RedisError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::TicketBackend;
use crate::config::{RedisConfig, RedisMode};
use crate::session::SessionError;
use crate::{Error, Result};

/// Connection strategy, chosen from configuration at startup.
pub enum RedisBackend {
    /// One node behind an auto-reconnecting manager
    Single(ConnectionManager),
    /// Master resolved through Sentinel
    Sentinel(SentinelBackend),
    /// Cluster-aware connection
    Cluster(ClusterConnection),
}

/// Sentinel client with a cached master connection.
///
/// The cached connection is dropped after any command error so the next
/// call asks the sentinels for the (possibly failed-over) master again.
pub struct SentinelBackend {
    client: Mutex<SentinelClient>,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Connect using the configured mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for missing or malformed URLs and
    /// [`Error::Internal`] when the initial connection fails.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let backend = match config.mode {
            RedisMode::Single => {
                let url = config
                    .connection_url
                    .as_deref()
                    .ok_or_else(|| Error::Config("session.redis.connection_url is required".to_string()))?;
                let mut info = parse_url(url)?;
                if let Some(ref password) = config.password {
                    info.redis.password = Some(password.clone());
                }
                let client = redis::Client::open(info).map_err(connect_error)?;
                let manager = ConnectionManager::new(client).await.map_err(connect_error)?;
                Self::Single(manager)
            }
            RedisMode::Sentinel => {
                let master = config
                    .sentinel_master_name
                    .clone()
                    .ok_or_else(|| Error::Config("session.redis.sentinel_master_name is required".to_string()))?;
                let sentinels = config
                    .sentinel_connection_urls
                    .iter()
                    .map(|url| {
                        let mut info = parse_url(url)?;
                        if let Some(ref password) = config.sentinel_password {
                            info.redis.password = Some(password.clone());
                        }
                        Ok(info)
                    })
                    .collect::<Result<Vec<ConnectionInfo>>>()?;
                let node_info = SentinelNodeConnectionInfo {
                    tls_mode: None,
                    redis_connection_info: Some(RedisConnectionInfo {
                        password: config.password.clone(),
                        ..RedisConnectionInfo::default()
                    }),
                };
                let client = SentinelClient::build(sentinels, master, Some(node_info), SentinelServerType::Master)
                    .map_err(connect_error)?;
                let backend = SentinelBackend {
                    client: Mutex::new(client),
                    connection: Mutex::new(None),
                };
                // Fail fast on an unreachable sentinel set
                backend.connection().await.map_err(|e| Error::Internal(e.to_string()))?;
                Self::Sentinel(backend)
            }
            RedisMode::Cluster => {
                let mut builder = ClusterClient::builder(config.cluster_connection_urls.clone());
                if let Some(ref password) = config.password {
                    builder = builder.password(password.clone());
                }
                let client = builder.build().map_err(connect_error)?;
                let connection = client.get_async_connection().await.map_err(connect_error)?;
                Self::Cluster(connection)
            }
        };

        info!(mode = ?config.mode, "Connected to Redis session backend");
        Ok(backend)
    }
}

impl SentinelBackend {
    async fn connection(&self) -> std::result::Result<MultiplexedConnection, SessionError> {
        let mut cached = self.connection.lock().await;
        if let Some(ref conn) = *cached {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .lock()
            .await
            .get_async_connection()
            .await
            .map_err(unavailable)?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self) {
        *self.connection.lock().await = None;
    }

    async fn run<T, F, Fut>(&self, op: F) -> std::result::Result<T, SessionError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Send,
        Fut: std::future::Future<Output = redis::RedisResult<T>> + Send,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, "Sentinel master command failed, dropping cached connection");
                self.invalidate().await;
                Err(unavailable(e))
            }
        }
    }
}

fn parse_url(url: &str) -> Result<ConnectionInfo> {
    url.into_connection_info()
        .map_err(|e| Error::Config(format!("Invalid Redis URL {url}: {e}")))
}

fn connect_error(e: RedisError) -> Error {
    Error::Internal(format!("Redis connection failed: {e}"))
}

fn unavailable(e: RedisError) -> SessionError {
    SessionError::StoreUnavailable(e.to_string())
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl TicketBackend for RedisBackend {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> std::result::Result<(), SessionError> {
        let secs = ttl_secs(ttl);
        match self {
            Self::Single(manager) => {
                let mut conn = manager.clone();
                conn.set_ex::<_, _, ()>(key, value, secs).await.map_err(unavailable)
            }
            Self::Sentinel(sentinel) => {
                sentinel
                    .run(|mut conn| async move { conn.set_ex::<_, _, ()>(key, value, secs).await })
                    .await
            }
            Self::Cluster(cluster) => {
                let mut conn = cluster.clone();
                conn.set_ex::<_, _, ()>(key, value, secs).await.map_err(unavailable)
            }
        }
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<String>, SessionError> {
        match self {
            Self::Single(manager) => {
                let mut conn = manager.clone();
                conn.get::<_, Option<String>>(key).await.map_err(unavailable)
            }
            Self::Sentinel(sentinel) => {
                sentinel
                    .run(|mut conn| async move { conn.get::<_, Option<String>>(key).await })
                    .await
            }
            Self::Cluster(cluster) => {
                let mut conn = cluster.clone();
                conn.get::<_, Option<String>>(key).await.map_err(unavailable)
            }
        }
    }

    async fn del(&self, key: &str) -> std::result::Result<(), SessionError> {
        match self {
            Self::Single(manager) => {
                let mut conn = manager.clone();
                conn.del::<_, ()>(key).await.map_err(unavailable)
            }
            Self::Sentinel(sentinel) => {
                sentinel
                    .run(|mut conn| async move { conn.del::<_, ()>(key).await })
                    .await
            }
            Self::Cluster(cluster) => {
                let mut conn = cluster.clone();
                conn.del::<_, ()>(key).await.map_err(unavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(604_800)), 604_800);
    }

    #[test]
    fn malformed_url_is_config_error() {
        assert!(matches!(parse_url("not a url"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn single_mode_requires_url() {
        let config = RedisConfig::default();
        assert!(matches!(RedisBackend::connect(&config).await, Err(Error::Config(_))));
    }
}
