//! Key-value store contract backing the claims cache.
//!
//! [`CacheStore`] is the small subset of Redis semantics the gateway relies
//! on: plain string keys, hash keys with named fields, and per-key expiry.
//! Two implementations ship: [`MemoryStore`] for a single instance and
//! [`RedisStore`] when several gateway instances must share sign-outs.

mod claims;
mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use claims::{CacheStatsSnapshot, ClaimsCache, Lookup};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::config::{CacheBackend, CacheConfig};
use crate::{Error, Result};

/// Cache backend failures
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Backend could not be reached or refused the command
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Operation used against a key holding the wrong kind of value
    #[error("wrong value type for key")]
    WrongType,
}

/// Cache service operations.
///
/// Hash operations store several named fields under one key; expiry applies
/// to the key as a whole.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a string key
    async fn get(&self, key: &str) -> std::result::Result<Option<String>, CacheError>;

    /// Write a string key, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> std::result::Result<(), CacheError>;

    /// Set expiry on an existing key. Returns `false` if the key does not exist.
    async fn set_ttl(&self, key: &str, ttl: Duration) -> std::result::Result<bool, CacheError>;

    /// Delete a key. Returns the number of keys removed.
    async fn delete(&self, key: &str) -> std::result::Result<u64, CacheError>;

    /// Number of the given key that exist (0 or 1)
    async fn exists(&self, key: &str) -> std::result::Result<u64, CacheError>;

    /// Write fields into a hash key, creating it if needed
    async fn set_hash(&self, key: &str, fields: &[(&str, &str)]) -> std::result::Result<(), CacheError>;

    /// Read one field of a hash key
    async fn get_hash(&self, key: &str, field: &str) -> std::result::Result<Option<String>, CacheError>;

    /// Remove a hash key with all of its fields
    async fn invalidate_hash(&self, key: &str) -> std::result::Result<(), CacheError>;

    /// Remaining lifetime of a key; `None` if missing or without expiry
    async fn ttl(&self, key: &str) -> std::result::Result<Option<Duration>, CacheError>;

    /// Short backend name, for logs and `/health`
    fn backend_name(&self) -> &'static str;

    /// Drop expired entries. Backends that expire keys themselves do nothing.
    ///
    /// Returns the number of entries removed.
    fn evict_expired(&self) -> usize {
        0
    }
}

/// Run [`CacheStore::evict_expired`] every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    store: Arc<dyn CacheStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = store.evict_expired();
                    if evicted > 0 {
                        tracing::debug!(evicted, backend = store.backend_name(), "Swept expired cache entries");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Build the store selected by `config`.
///
/// Returns `None` for [`CacheBackend::Disabled`].
///
/// # Errors
///
/// Returns [`Error::Config`] if the Redis URL is missing or malformed.
pub fn build_store(config: &CacheConfig) -> Result<Option<Arc<dyn CacheStore>>> {
    match config.backend {
        CacheBackend::Disabled => Ok(None),
        CacheBackend::Memory => Ok(Some(Arc::new(MemoryStore::new()))),
        CacheBackend::Redis => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| Error::Config("cache.url is required for the redis backend".to_string()))?;
            let store = RedisStore::new(url).map_err(|e| Error::Config(e.to_string()))?;
            Ok(Some(Arc::new(store)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_backend_builds_no_store() {
        let config = CacheConfig {
            backend: CacheBackend::Disabled,
            ..CacheConfig::default()
        };
        assert!(build_store(&config).unwrap().is_none());
    }

    #[test]
    fn memory_backend_is_default() {
        let store = build_store(&CacheConfig::default()).unwrap().unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[test]
    fn malformed_redis_url_is_a_config_error() {
        let config = CacheConfig {
            backend: CacheBackend::Redis,
            url: Some("not a url".to_string()),
            ..CacheConfig::default()
        };
        assert!(matches!(build_store(&config), Err(Error::Config(_))));
    }
}
