//! Bearer authentication for protected routes.
//!
//! Supports:
//! - Claims cache short-circuit (no signature check for a cached, unexpired token)
//! - Full validation on a miss, with the result cached until the token expires
//! - A direct-validate mode when caching is disabled
//! - Sign-out invalidation

use std::sync::Arc;

use axum::http::{HeaderMap, header};
use tracing::{debug, warn};

use crate::cache::{ClaimsCache, Lookup};
use crate::error::Rejection;
use crate::token::{TokenClaims, TokenVerifier, extract_bearer};

/// Pull the bearer token from request headers, if any
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
}

/// Resolves a bearer token to validated claims.
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    cache: Option<Arc<ClaimsCache>>,
}

impl Authenticator {
    /// Create an authenticator. Without a cache every request is fully validated.
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>, cache: Option<Arc<ClaimsCache>>) -> Self {
        Self { verifier, cache }
    }

    /// Claims cache, if enabled
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<ClaimsCache>> {
        self.cache.as_ref()
    }

    /// Authenticate `token`.
    ///
    /// A sign-out for the same token that lands while it is being validated
    /// wins: the claims are returned for this request but not cached.
    pub async fn authenticate(&self, token: &str) -> Result<TokenClaims, Rejection> {
        let Some(ref cache) = self.cache else {
            return self.validate(token).await;
        };

        match cache.lookup(token).await {
            Lookup::Hit(claims) => {
                debug!(subject = %claims.subject, "Claims cache hit");
                Ok(claims)
            }
            Lookup::Expired => {
                debug!("Rejecting expired token found in claims cache");
                Err(Rejection::InvalidToken)
            }
            Lookup::Miss => {
                let generation = cache.generation();
                let claims = self.validate(token).await?;
                if let Err(e) = cache.store_unless_invalidated(token, &claims, generation).await {
                    warn!(error = %e, "Failed to cache token claims");
                }
                Ok(claims)
            }
        }
    }

    async fn validate(&self, token: &str) -> Result<TokenClaims, Rejection> {
        self.verifier.validate(token).await.map_err(|e| {
            warn!(error = %e, "Token rejected");
            Rejection::from(e)
        })
    }

    /// Drop any cached claims for `token`.
    pub async fn sign_out(&self, token: &str) -> Result<(), Rejection> {
        let Some(ref cache) = self.cache else {
            return Ok(());
        };
        cache.invalidate(token).await.map_err(|e| {
            warn!(error = %e, "Failed to invalidate cached claims on sign-out");
            Rejection::CacheUnavailable
        })
    }
}
