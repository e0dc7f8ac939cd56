//! Signing key set - fetching, caching and refreshing the JWKS used to verify
//! bearer token signatures.
//!
//! # Lifecycle
//!
//! 1. [`KeySetManager::new`] fetches the key set once. Failure is fatal: the
//!    gateway cannot authenticate anyone without keys.
//! 2. [`KeySetManager::spawn_refresher`] replaces the key set on a fixed
//!    interval. A failed refresh is logged and the previous key set stays in
//!    service.
//! 3. A token whose `kid` is not in the current key set triggers one on-demand
//!    refresh per unknown `kid` before it is rejected, so rotated keys are
//!    picked up without waiting for the next interval.
//!
//! Readers take an `Arc` snapshot of the whole [`KeySet`]; a refresh swaps the
//! pointer, so a reader sees either the old or the new set, never a mix.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    DecodingKey, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Unknown `kid`s remembered before the set is reset
const MAX_TRACKED_UNKNOWN_KIDS: usize = 4096;

/// Error variants for key set fetching and signature verification.
#[derive(Debug, thiserror::Error)]
pub enum KeySetError {
    /// Network or HTTP error while fetching the key set.
    #[error("JWKS fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The key set endpoint answered with a non-success status.
    #[error("JWKS endpoint returned HTTP {0}")]
    Status(u16),

    /// The key set document contained no usable verification key.
    #[error("JWKS contains no usable keys")]
    Empty,

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the key set, even after a refresh.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// JWT decode / signature verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Where key set documents come from.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetch the current key set document.
    async fn fetch(&self) -> Result<JwkSet, KeySetError>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Fetches the key set with a plain HTTPS GET.
pub struct HttpKeySetSource {
    http: reqwest::Client,
    uri: String,
}

impl HttpKeySetSource {
    /// Create a source for `uri`.
    ///
    /// With `require_https` the client refuses plain-HTTP URLs and redirects.
    ///
    /// # Errors
    ///
    /// Returns [`KeySetError::Fetch`] if the HTTP client cannot be built.
    pub fn new(uri: impl Into<String>, timeout: Duration, require_https: bool) -> Result<Self, KeySetError> {
        let http = reqwest::Client::builder()
            .https_only(require_https)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            uri: uri.into(),
        })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<JwkSet, KeySetError> {
        debug!(uri = %self.uri, "Fetching JWKS");
        let response = self.http.get(&self.uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeySetError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

/// Immutable snapshot of verification keys indexed by `kid`.
pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
    refreshed_at: DateTime<Utc>,
}

impl KeySet {
    /// Build a snapshot from a key set document, skipping keys that have no
    /// `kid` or cannot be used for signature verification.
    #[must_use]
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter_map(|jwk| {
                let kid = jwk.common.key_id.clone()?;
                let key = match &jwk.algorithm {
                    AlgorithmParameters::RSA(rsa) => {
                        DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok()
                    }
                    AlgorithmParameters::EllipticCurve(ec) => {
                        DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
                    }
                    AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
                };
                if key.is_none() {
                    debug!(kid = %kid, "Skipping unusable JWK");
                }
                key.map(|k| (kid, k))
            })
            .collect();

        Self {
            keys,
            refreshed_at: Utc::now(),
        }
    }

    /// Key for `kid`, if present
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    /// Number of usable keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no usable keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// When this snapshot was fetched
    #[must_use]
    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }
}

/// Owns the current [`KeySet`] and keeps it fresh.
pub struct KeySetManager {
    source: Arc<dyn KeySetSource>,
    current: RwLock<Arc<KeySet>>,
    /// Serializes fetches so concurrent misses on one `kid` cause one request
    refresh_gate: tokio::sync::Mutex<()>,
    /// `kid`s that already had their on-demand refresh
    unknown_kids: Mutex<HashSet<String>>,
}

impl KeySetManager {
    /// Fetch the initial key set.
    ///
    /// # Errors
    ///
    /// Returns an error if the first fetch fails or yields no usable key.
    pub async fn new(source: Arc<dyn KeySetSource>) -> Result<Self, KeySetError> {
        let jwks = source.fetch().await?;
        let keys = KeySet::from_jwks(&jwks);
        if keys.is_empty() {
            return Err(KeySetError::Empty);
        }

        info!(source = %source.describe(), keys = keys.len(), "Loaded signing key set");

        Ok(Self {
            source,
            current: RwLock::new(Arc::new(keys)),
            refresh_gate: tokio::sync::Mutex::new(()),
            unknown_kids: Mutex::new(HashSet::new()),
        })
    }

    /// Current key set
    #[must_use]
    pub fn snapshot(&self) -> Arc<KeySet> {
        Arc::clone(&self.current.read())
    }

    /// Re-fetch and swap in the key set. On failure the current set is kept.
    ///
    /// Returns the number of usable keys now in service.
    pub async fn refresh(&self) -> Result<usize, KeySetError> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<usize, KeySetError> {
        let jwks = self.source.fetch().await?;
        let keys = KeySet::from_jwks(&jwks);
        if keys.is_empty() {
            return Err(KeySetError::Empty);
        }

        let count = keys.len();
        *self.current.write() = Arc::new(keys);
        debug!(keys = count, "Signing key set refreshed");
        Ok(count)
    }

    /// Resolve the verification key for `kid`, refreshing once if unknown.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, KeySetError> {
        if let Some(key) = self.snapshot().get(kid) {
            return Ok(key.clone());
        }

        let already_tried = self.unknown_kids.lock().contains(kid);
        if already_tried {
            return Err(KeySetError::UnknownKeyId(kid.to_string()));
        }

        let _gate = self.refresh_gate.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(key) = self.snapshot().get(kid) {
            return Ok(key.clone());
        }
        let already_tried = self.unknown_kids.lock().contains(kid);
        if already_tried {
            return Err(KeySetError::UnknownKeyId(kid.to_string()));
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        if let Err(e) = self.refresh_locked().await {
            warn!(kid = %kid, error = %e, "On-demand JWKS refresh failed");
        }

        if let Some(key) = self.snapshot().get(kid) {
            return Ok(key.clone());
        }

        let mut unknown = self.unknown_kids.lock();
        if unknown.len() >= MAX_TRACKED_UNKNOWN_KIDS {
            unknown.clear();
        }
        unknown.insert(kid.to_string());
        Err(KeySetError::UnknownKeyId(kid.to_string()))
    }

    /// Verify the token's signature with the key named by its `kid` and
    /// decode its claims under `validation`.
    pub async fn verify(&self, token: &str, validation: &Validation) -> Result<TokenData<Value>, KeySetError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(KeySetError::MissingKeyId)?;
        let key = self.decoding_key(&kid).await?;
        Ok(jsonwebtoken::decode::<Value>(token, &key, validation)?)
    }

    /// Refresh the key set every `interval` until `shutdown` fires.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the initial fetch already happened.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.refresh().await {
                            Ok(keys) => info!(keys, "Signing key set refreshed"),
                            Err(e) => warn!(error = %e, "JWKS refresh failed, keeping previous key set"),
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Key set refresher stopped");
                        break;
                    }
                }
            }
        })
    }
}
