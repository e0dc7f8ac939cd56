//! Process-local cache store

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CacheError, CacheStore};

enum Stored {
    Text(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory store with per-key expiry.
///
/// Expired keys are invisible to every read and removed lazily on access or
/// by [`CacheStore::evict_expired`].
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet swept
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Stored::Text(v) => Ok(Some(v.clone())),
                Stored::Hash(_) => Err(CacheError::WrongType),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let entry = Entry {
            value: Stored::Text(value.to_string()),
            expires_at: ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.purge_if_expired(key);
        if ttl.is_zero() {
            // Expiring now is a delete
            return Ok(self.entries.remove(key).is_some());
        }
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        self.purge_if_expired(key);
        Ok(u64::from(self.entries.remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<u64, CacheError> {
        self.purge_if_expired(key);
        Ok(u64::from(self.entries.contains_key(key)))
    }

    async fn set_hash(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), CacheError> {
        self.purge_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Hash(map) => {
                for (field, value) in fields {
                    map.insert((*field).to_string(), (*value).to_string());
                }
                Ok(())
            }
            Stored::Text(_) => Err(CacheError::WrongType),
        }
    }

    async fn get_hash(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Stored::Hash(map) => Ok(map.get(field).cloned()),
                Stored::Text(_) => Err(CacheError::WrongType),
            },
        }
    }

    async fn invalidate_hash(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.purge_if_expired(key);
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}
