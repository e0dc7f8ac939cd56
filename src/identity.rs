//! Secondary verification against the identity provider.
//!
//! A locally valid signature only proves the token was issued; it says nothing
//! about a global sign-out or an admin disabling the user since. When secondary
//! verification is enabled, every token that is not already cached is also
//! presented to the provider's "get user by access token" operation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Cognito `GetUser` operation target
const GET_USER_TARGET: &str = "AWSCognitoIdentityProviderService.GetUser";

/// Why the provider did not vouch for a token
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The provider answered and refused the token
    #[error("identity provider rejected the token (HTTP {status}): {reason}")]
    Rejected {
        /// HTTP status of the provider response
        status: u16,
        /// Provider error type or body excerpt
        reason: String,
    },

    /// The provider could not be reached
    #[error("identity provider unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

/// Live token check against the issuing identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(())` if the provider still accepts `token`.
    async fn get_user(&self, token: &str) -> Result<(), IdentityError>;
}

/// Cognito user pool client speaking the JSON 1.1 protocol.
///
/// `GetUser` is authorized by the access token itself, so no request signing
/// is needed.
pub struct CognitoIdentityProvider {
    http: reqwest::Client,
    endpoint: String,
}

impl CognitoIdentityProvider {
    /// Create a client for `endpoint` (e.g. `https://cognito-idp.eu-west-1.amazonaws.com/`).
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unreachable`] if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl IdentityProvider for CognitoIdentityProvider {
    async fn get_user(&self, token: &str) -> Result<(), IdentityError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", GET_USER_TARGET)
            .body(json!({ "AccessToken": token }).to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("Identity provider accepted token");
            return Ok(());
        }

        let reason = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).to_string());
        let reason = match reason {
            Some(r) => r,
            None => response.text().await.unwrap_or_default().chars().take(200).collect(),
        };

        Err(IdentityError::Rejected {
            status: status.as_u16(),
            reason,
        })
    }
}
