//! Validated-claims cache keyed by raw bearer token.
//!
//! Each entry is one hash key (the token) with two fields:
//!
//! - `claims`: the decoded claim set as JSON
//! - `roles`: the role set as a JSON array
//!
//! The key expires at the token's own `exp`, so an entry never outlives the
//! token it describes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CacheError, CacheStore};
use crate::token::TokenClaims;

const CLAIMS_FIELD: &str = "claims";
const ROLES_FIELD: &str = "roles";

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Live entry for an unexpired token
    Hit(TokenClaims),
    /// Entry exists but the token's `exp` has passed
    Expired,
    /// No usable entry, or the store failed
    Miss,
}

/// Counters tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit rate (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Store backing the cache
    pub backend: &'static str,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that fell through to full validation
    pub misses: u64,
    /// Entries written
    pub stores: u64,
    /// Entries removed by sign-out
    pub invalidations: u64,
    /// Store operations that failed
    pub errors: u64,
    /// `hits / (hits + misses)`
    pub hit_rate: f64,
}

/// Claims cache over a [`CacheStore`].
///
/// Store failures on lookup and store are logged and reported as a miss;
/// only [`ClaimsCache::invalidate`] surfaces them, since sign-out must not
/// succeed without removing the entry.
pub struct ClaimsCache {
    store: Arc<dyn CacheStore>,
    stats: CacheStats,
    /// Bumped before every invalidation
    generation: AtomicU64,
}

impl ClaimsCache {
    /// Wrap `store`
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            stats: CacheStats::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Underlying store
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Look up the cached claims for `token`.
    pub async fn lookup(&self, token: &str) -> Lookup {
        match self.read_entry(token).await {
            Ok(Some(claims)) => {
                if claims.is_expired_at(Utc::now()) {
                    debug!(subject = %claims.subject, "Cached token has expired");
                    if let Err(e) = self.store.invalidate_hash(token).await {
                        warn!(error = %e, "Failed to drop expired cache entry");
                    }
                    CacheStats::bump(&self.stats.misses);
                    return Lookup::Expired;
                }
                CacheStats::bump(&self.stats.hits);
                Lookup::Hit(claims)
            }
            Ok(None) => {
                CacheStats::bump(&self.stats.misses);
                Lookup::Miss
            }
            Err(e) => {
                warn!(error = %e, backend = self.store.backend_name(), "Claims cache lookup failed, falling back to full validation");
                CacheStats::bump(&self.stats.errors);
                CacheStats::bump(&self.stats.misses);
                Lookup::Miss
            }
        }
    }

    async fn read_entry(&self, token: &str) -> Result<Option<TokenClaims>, CacheError> {
        let Some(roles) = self.store.get_hash(token, ROLES_FIELD).await? else {
            return Ok(None);
        };
        let Some(claims) = self.store.get_hash(token, CLAIMS_FIELD).await? else {
            return Ok(None);
        };

        let decoded = serde_json::from_str::<BTreeSet<String>>(&roles)
            .ok()
            .zip(serde_json::from_str::<Value>(&claims).ok())
            .and_then(|(roles, raw)| TokenClaims::from_parts(raw, roles).ok());

        if decoded.is_none() {
            warn!("Discarding undecodable claims cache entry");
            self.store.invalidate_hash(token).await?;
        }
        Ok(decoded)
    }

    /// Cache `claims` for `token` until the token expires.
    ///
    /// Returns `Ok(false)` without writing if the token has no remaining
    /// lifetime.
    pub async fn store(&self, token: &str, claims: &TokenClaims) -> Result<bool, CacheError> {
        let Some(ttl) = claims.remaining_lifetime(Utc::now()) else {
            return Ok(false);
        };

        let roles = serde_json::to_string(&claims.roles).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let raw = claims.raw.to_string();

        match self.write_entry(token, &raw, &roles, ttl).await {
            Ok(()) => {
                CacheStats::bump(&self.stats.stores);
                debug!(subject = %claims.subject, ttl_secs = ttl.as_secs(), "Cached token claims");
                Ok(true)
            }
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                // An entry without expiry would outlive the token
                if let Err(cleanup) = self.store.delete(token).await {
                    warn!(error = %cleanup, "Failed to remove partially written cache entry");
                }
                Err(e)
            }
        }
    }

    async fn write_entry(&self, token: &str, raw: &str, roles: &str, ttl: Duration) -> Result<(), CacheError> {
        self.store
            .set_hash(token, &[(CLAIMS_FIELD, raw), (ROLES_FIELD, roles)])
            .await?;
        if self.store.set_ttl(token, ttl).await? {
            Ok(())
        } else {
            Err(CacheError::Unavailable("entry vanished before expiry was set".to_string()))
        }
    }

    /// Invalidation generation, to be read before validating a token and
    /// passed to [`ClaimsCache::store_unless_invalidated`].
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Like [`ClaimsCache::store`], but writes nothing if any invalidation
    /// started after `generation` was read.
    ///
    /// The generation is checked again after the write: an invalidation that
    /// raced the write either sees the entry and deletes it, or is seen here
    /// and the entry is deleted. Only invalidations through this process are
    /// tracked.
    pub async fn store_unless_invalidated(
        &self,
        token: &str,
        claims: &TokenClaims,
        generation: u64,
    ) -> Result<bool, CacheError> {
        if self.generation() != generation {
            debug!(subject = %claims.subject, "Token signed out during validation; not caching");
            return Ok(false);
        }
        let stored = self.store(token, claims).await?;
        if stored && self.generation() != generation {
            debug!(subject = %claims.subject, "Token signed out while caching; dropping entry");
            self.store.invalidate_hash(token).await?;
            return Ok(false);
        }
        Ok(stored)
    }

    /// Remove every cached field for `token`.
    pub async fn invalidate(&self, token: &str) -> Result<(), CacheError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match self.store.invalidate_hash(token).await {
            Ok(()) => {
                CacheStats::bump(&self.stats.invalidations);
                Ok(())
            }
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                Err(e)
            }
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            backend: self.store.backend_name(),
            hits,
            misses,
            stores: self.stats.stores.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            hit_rate: CacheStats::hit_rate(hits, misses),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::cache::MemoryStore;

    fn claims_expiring_in(secs: i64, roles: &[&str]) -> TokenClaims {
        let expiry = Utc::now() + TimeDelta::seconds(secs);
        let roles: BTreeSet<String> = roles.iter().map(|r| (*r).to_string()).collect();
        let raw = json!({"sub": "user-1", "exp": expiry.timestamp(), "cognito:groups": roles});
        TokenClaims::from_parts(raw, roles).unwrap()
    }

    fn cache() -> (Arc<MemoryStore>, ClaimsCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = ClaimsCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn stored_claims_are_returned_on_lookup() {
        let (_, cache) = cache();
        let claims = claims_expiring_in(300, &["admin"]);

        assert!(cache.store("tok", &claims).await.unwrap());

        match cache.lookup("tok").await {
            Lookup::Hit(found) => {
                assert_eq!(found.subject, "user-1");
                assert_eq!(found.roles, claims.roles);
                assert_eq!(found.expiry.timestamp(), claims.expiry.timestamp());
            }
            other => panic!("expected hit, got {other:?}"),
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.stores), (1, 0, 1));
    }

    #[tokio::test]
    async fn entry_ttl_matches_token_lifetime() {
        let (store, cache) = cache();
        let claims = claims_expiring_in(120, &[]);

        cache.store("tok", &claims).await.unwrap();

        let ttl = store.ttl("tok").await.unwrap().unwrap();
        let expected = claims.remaining_lifetime(Utc::now()).unwrap();
        let diff = expected.abs_diff(ttl);
        assert!(diff <= Duration::from_secs(1), "ttl {ttl:?} vs lifetime {expected:?}");
    }

    #[tokio::test]
    async fn expired_token_is_not_stored() {
        let (store, cache) = cache();
        let claims = claims_expiring_in(-1, &["admin"]);

        assert!(!cache.store("tok", &claims).await.unwrap());
        assert_eq!(store.exists("tok").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entry_for_expired_token_is_reported_and_dropped() {
        // GIVEN: an entry written directly, whose claims carry a past exp
        let (store, cache) = cache();
        let past = Utc::now().timestamp() - 10;
        let raw = json!({"sub": "u", "exp": past}).to_string();
        store
            .set_hash("tok", &[(CLAIMS_FIELD, raw.as_str()), (ROLES_FIELD, "[\"admin\"]")])
            .await
            .unwrap();

        // WHEN / THEN
        assert_eq!(cache.lookup("tok").await, Lookup::Expired);
        assert_eq!(store.exists("tok").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalidate_makes_next_lookup_a_miss() {
        let (_, cache) = cache();
        cache.store("tok", &claims_expiring_in(300, &["admin"])).await.unwrap();

        cache.invalidate("tok").await.unwrap();

        assert_eq!(cache.lookup("tok").await, Lookup::Miss);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let (store, cache) = cache();
        store
            .set_hash("tok", &[(CLAIMS_FIELD, "not json"), (ROLES_FIELD, "[]")])
            .await
            .unwrap();

        assert_eq!(cache.lookup("tok").await, Lookup::Miss);
        assert_eq!(store.exists("tok").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_is_skipped_after_concurrent_invalidation() {
        // GIVEN: a generation read before validation, then a sign-out
        let (store, cache) = cache();
        let generation = cache.generation();
        cache.invalidate("tok").await.unwrap();

        // WHEN
        let stored = cache
            .store_unless_invalidated("tok", &claims_expiring_in(300, &["admin"]), generation)
            .await
            .unwrap();

        // THEN: nothing is written
        assert!(!stored);
        assert_eq!(store.exists("tok").await.unwrap(), 0);

        // A fresh generation stores normally
        let stored = cache
            .store_unless_invalidated("tok", &claims_expiring_in(300, &["admin"]), cache.generation())
            .await
            .unwrap();
        assert!(stored);
        assert_eq!(store.exists("tok").await.unwrap(), 1);
    }

    /// Store whose every operation fails
    struct DownStore;

    #[async_trait]
    impl CacheStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn set_ttl(&self, _: &str, _: Duration) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<u64, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<u64, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn set_hash(&self, _: &str, _: &[(&str, &str)]) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn get_hash(&self, _: &str, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn invalidate_hash(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_miss() {
        let cache = ClaimsCache::new(Arc::new(DownStore));

        assert_eq!(cache.lookup("tok").await, Lookup::Miss);
        assert!(cache.store("tok", &claims_expiring_in(60, &[])).await.is_err());
        assert!(cache.invalidate("tok").await.is_err());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.errors, 3);
    }
}
