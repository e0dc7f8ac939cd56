//! API Gateway Library
//!
//! Authorizing reverse proxy for HTTP backends.
//!
//! # Features
//!
//! - **Route Registry**: placeholder patterns, most-specific match wins
//! - **JWKS Verification**: signing keys fetched at startup, refreshed hourly and on unknown `kid`
//! - **Claims Cache**: validated roles cached per token until the token expires (memory or Redis)
//! - **RBAC**: per-route required roles
//! - **Secondary Verification**: optional live check against the identity provider
//! - **Sign-out**: explicit cache invalidation before forwarding
//!
//! # Request pipeline
//!
//! ```text
//! request -> registry -> [claims cache | token validator -> key set] -> authorizer -> dispatcher
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authz;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod keyset;
pub mod registry;
pub mod token;

pub use error::{Error, Rejection, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` selects `json` or the
/// default human-readable text output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
