//! Redis-backed cache store

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::OnceCell;
use tracing::info;

use super::{CacheError, CacheStore};

/// Upper bound on establishing the first connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Cache store on a shared Redis instance.
///
/// The connection is opened on first use, so the gateway starts even while
/// Redis is down; until it comes up every operation fails with
/// [`CacheError::Unavailable`] and callers fall back to full validation.
/// [`ConnectionManager`] reconnects on its own after that.
pub struct RedisStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Create a store for `url` (e.g. `redis://127.0.0.1:6379/0`).
    ///
    /// Only the URL is checked here; no connection is made.
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(self.client.clone()))
                    .await
                    .map_err(|_| CacheError::Unavailable("connection timed out".to_string()))?
                    .map_err(map_redis_error)?;
                info!("Connected to Redis cache");
                Ok::<_, CacheError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(map_redis_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let millis = ttl.map_or(0, duration_millis);
        if millis == 0 {
            conn.set::<_, _, ()>(key, value).await.map_err(map_redis_error)
        } else {
            conn.pset_ex::<_, _, ()>(key, value, millis)
                .await
                .map_err(map_redis_error)
        }
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let millis = i64::try_from(duration_millis(ttl)).unwrap_or(i64::MAX);
        conn.pexpire(key, millis).await.map_err(map_redis_error)
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        conn.del(key).await.map_err(map_redis_error)
    }

    async fn exists(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        conn.exists(key).await.map_err(map_redis_error)
    }

    async fn set_hash(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(map_redis_error)
    }

    async fn get_hash(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        conn.hget(key, field).await.map_err(map_redis_error)
    }

    async fn invalidate_hash(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await.map_err(map_redis_error)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.connection().await?;
        // -2: no such key, -1: no expiry
        let millis: i64 = conn.pttl(key).await.map_err(map_redis_error)?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn map_redis_error(err: RedisError) -> CacheError {
    if err.code() == Some("WRONGTYPE") {
        return CacheError::WrongType;
    }
    CacheError::Unavailable(err.to_string())
}
