//! Bearer token validation and typed claim extraction.
//!
//! # Validation steps
//!
//! 1. Decode the JWT header (no verification) and check the algorithm.
//! 2. Verify the signature with the key named by `kid` ([`KeySetManager`]),
//!    together with `exp` and `iss`.
//! 3. Decode the registered claims into [`TokenClaims`] and check expiry again
//!    against the local clock. This check never depends on a cache.
//! 4. Optionally ask the identity provider whether the token is still live.
//! 5. Extract roles from the configured role claim. An absent claim yields an
//!    empty role set.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Rejection;
use crate::identity::{IdentityError, IdentityProvider};
use crate::keyset::{KeySetError, KeySetManager};

/// Algorithms accepted for bearer tokens
const SUPPORTED_ALGORITHMS: [Algorithm; 5] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Why a token was not accepted
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Not a structurally valid JWT
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Header names an algorithm we do not verify
    #[error("unsupported token algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    /// Signature, `kid` or issuer check failed
    #[error("signature verification failed: {0}")]
    Signature(KeySetError),

    /// `exp` is in the past
    #[error("token expired")]
    Expired,

    /// Registered claims are missing or have the wrong type
    #[error("malformed claims: {0}")]
    MalformedClaims(String),

    /// The identity provider no longer accepts the token
    #[error("token revoked: {0}")]
    Revoked(#[from] IdentityError),
}

impl From<KeySetError> for TokenError {
    fn from(err: KeySetError) -> Self {
        match &err {
            KeySetError::Jwt(jwt) => match jwt.kind() {
                ErrorKind::ExpiredSignature => Self::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => Self::Malformed(err.to_string()),
                _ => Self::Signature(err),
            },
            _ => Self::Signature(err),
        }
    }
}

impl From<TokenError> for Rejection {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Revoked(_) => Self::RevokedToken,
            _ => Self::InvalidToken,
        }
    }
}

/// Registered claims every accepted token must carry.
#[derive(Debug, Deserialize)]
struct RegisteredClaims {
    sub: String,
    exp: i64,
}

/// Validated identity and role data carried by a token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    /// `sub` claim
    pub subject: String,
    /// `exp` claim
    pub expiry: DateTime<Utc>,
    /// Roles taken from the role claim
    pub roles: BTreeSet<String>,
    /// Full decoded claim set
    pub raw: Value,
}

impl TokenClaims {
    /// Decode claims, taking roles from `role_claim`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::MalformedClaims`] if `sub` or `exp` is missing or mistyped.
    pub fn decode(raw: Value, role_claim: &str) -> Result<Self, TokenError> {
        let roles = extract_roles(&raw, role_claim);
        Self::from_parts(raw, roles)
    }

    /// Decode registered claims from `raw` and attach an already known role set.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::MalformedClaims`] if `sub` or `exp` is missing or mistyped.
    pub fn from_parts(raw: Value, roles: BTreeSet<String>) -> Result<Self, TokenError> {
        let registered = RegisteredClaims::deserialize(&raw)
            .map_err(|e| TokenError::MalformedClaims(e.to_string()))?;
        let expiry = DateTime::from_timestamp(registered.exp, 0)
            .ok_or_else(|| TokenError::MalformedClaims(format!("exp out of range: {}", registered.exp)))?;

        Ok(Self {
            subject: registered.sub,
            expiry,
            roles,
            raw,
        })
    }

    /// Whether the token is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// Time left until expiry, or `None` once expired
    #[must_use]
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> Option<Duration> {
        let left: TimeDelta = self.expiry - now;
        left.to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Roles from `claim`. Absent ⇒ empty. A value that is not a list of
/// strings is logged and ignored.
fn extract_roles(raw: &Value, claim: &str) -> BTreeSet<String> {
    match raw.get(claim) {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Array(items)) => {
            let roles: Option<BTreeSet<String>> = items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect();
            roles.unwrap_or_else(|| {
                warn!(claim = %claim, "Role claim contains non-string entries; treating as no roles");
                BTreeSet::new()
            })
        }
        Some(other) => {
            warn!(claim = %claim, kind = %json_kind(other), "Role claim is not a list; treating as no roles");
            BTreeSet::new()
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Pull the token out of an `Authorization` header value.
///
/// Only `Bearer <token>` (scheme case-insensitive, exactly two parts) is
/// accepted; anything else counts as no token.
#[must_use]
pub fn extract_bearer(header: &str) -> Option<&str> {
    let mut parts = header.split(' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || token.is_empty() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

/// Full token validation, as called on a cache miss.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Validate `token` and return its claims.
    async fn validate(&self, token: &str) -> Result<TokenClaims, TokenError>;
}

/// Settings for [`TokenValidator`]
#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    /// Expected `iss`
    pub issuer: String,
    /// Claim holding roles
    pub role_claim: String,
    /// Clock skew tolerance for `exp`
    pub leeway_secs: u64,
}

/// Signature + expiry validator with optional identity provider check.
pub struct TokenValidator {
    keys: Arc<KeySetManager>,
    identity: Option<Arc<dyn IdentityProvider>>,
    settings: ValidatorSettings,
}

impl TokenValidator {
    /// Create a validator. Pass an identity provider to enable secondary verification.
    #[must_use]
    pub fn new(
        keys: Arc<KeySetManager>,
        identity: Option<Arc<dyn IdentityProvider>>,
        settings: ValidatorSettings,
    ) -> Self {
        Self {
            keys,
            identity,
            settings,
        }
    }

    fn validation_for(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.leeway = self.settings.leeway_secs;
        v.validate_exp = true;
        v.validate_aud = false;
        v.set_required_spec_claims(&["exp", "sub", "iss"]);
        v.set_issuer(&[self.settings.issuer.as_str()]);
        v
    }
}

#[async_trait]
impl TokenVerifier for TokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let data = self
            .keys
            .verify(token, &self.validation_for(header.alg))
            .await?;

        let claims = TokenClaims::decode(data.claims, &self.settings.role_claim)?;
        let leeway = i64::try_from(self.settings.leeway_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now().checked_sub_signed(leeway).unwrap_or(DateTime::<Utc>::MIN_UTC);
        if claims.is_expired_at(cutoff) {
            return Err(TokenError::Expired);
        }

        if let Some(ref identity) = self.identity {
            identity.get_user(token).await?;
        }

        debug!(subject = %claims.subject, roles = claims.roles.len(), "Token validated");
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_bearer_accepts_case_insensitive_scheme() {
        assert_eq!(extract_bearer("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("BEARER abc"), Some("abc"));
    }

    #[test]
    fn extract_bearer_rejects_other_shapes() {
        assert_eq!(extract_bearer(""), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Basic dXNlcjpwYXNz"), None);
        assert_eq!(extract_bearer("Bearer a b"), None);
        assert_eq!(extract_bearer("abc.def.ghi"), None);
    }

    #[test]
    fn decode_reads_roles_from_configured_claim() {
        let raw = json!({"sub": "u-1", "exp": 4_102_444_800_i64, "cognito:groups": ["admin", "ops"]});
        let claims = TokenClaims::decode(raw, "cognito:groups").unwrap();

        assert_eq!(claims.subject, "u-1");
        assert_eq!(claims.expiry.timestamp(), 4_102_444_800);
        assert_eq!(
            claims.roles,
            BTreeSet::from(["admin".to_string(), "ops".to_string()])
        );
    }

    #[test]
    fn absent_role_claim_is_empty_role_set() {
        let raw = json!({"sub": "u-1", "exp": 4_102_444_800_i64});
        let claims = TokenClaims::decode(raw, "cognito:groups").unwrap();
        assert!(claims.roles.is_empty());
    }

    #[test]
    fn malformed_role_claim_is_empty_role_set() {
        for groups in [json!("admin"), json!([1, 2]), json!({"admin": true}), json!(["admin", 3])] {
            let raw = json!({"sub": "u-1", "exp": 4_102_444_800_i64, "cognito:groups": groups});
            let claims = TokenClaims::decode(raw, "cognito:groups").unwrap();
            assert!(claims.roles.is_empty(), "roles should be empty for {groups}");
        }
    }

    #[test]
    fn missing_registered_claims_are_malformed() {
        let no_sub = json!({"exp": 4_102_444_800_i64});
        assert!(matches!(
            TokenClaims::decode(no_sub, "groups"),
            Err(TokenError::MalformedClaims(_))
        ));

        let string_exp = json!({"sub": "u-1", "exp": "tomorrow"});
        assert!(matches!(
            TokenClaims::decode(string_exp, "groups"),
            Err(TokenError::MalformedClaims(_))
        ));
    }

    #[test]
    fn remaining_lifetime_tracks_expiry() {
        let now = Utc::now();
        let claims = TokenClaims {
            subject: "u".to_string(),
            expiry: now + TimeDelta::seconds(90),
            roles: BTreeSet::new(),
            raw: json!({}),
        };

        assert_eq!(claims.remaining_lifetime(now), Some(Duration::from_secs(90)));
        assert!(!claims.is_expired_at(now));
        assert!(claims.is_expired_at(now + TimeDelta::seconds(90)));
        assert_eq!(claims.remaining_lifetime(now + TimeDelta::seconds(91)), None);
        assert_eq!(claims.remaining_lifetime(now + TimeDelta::seconds(90)), None);
    }

    #[test]
    fn revoked_maps_to_revoked_rejection() {
        let revoked = TokenError::Revoked(IdentityError::Rejected {
            status: 400,
            reason: "NotAuthorizedException".to_string(),
        });
        assert_eq!(Rejection::from(revoked), Rejection::RevokedToken);
        assert_eq!(Rejection::from(TokenError::Expired), Rejection::InvalidToken);
    }
}
