//! Error types for the gateway
//!
//! [`Error`] covers startup and infrastructure failures. [`Rejection`] is the
//! client-facing outcome of the request pipeline and maps one-to-one onto an
//! HTTP status.

use std::io;

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::cache::CacheError;
use crate::keyset::KeySetError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key set could not be loaded
    #[error("Key set error: {0}")]
    KeySet(#[from] KeySetError),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Terminal outcome of the request pipeline, rendered straight to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No usable `Authorization: Bearer` header
    #[error("Unauthorized")]
    MissingToken,

    /// Malformed, badly signed or expired token
    #[error("Invalid token")]
    InvalidToken,

    /// The identity provider no longer accepts the token
    #[error("Token revoked")]
    RevokedToken,

    /// No registered route pattern matches the path
    #[error("Service Not Found")]
    NoMatchingRoute,

    /// Caller holds none of the roles the route requires
    #[error("Forbidden")]
    Forbidden,

    /// Backend target is malformed or unreachable
    #[error("Bad Gateway: {0}")]
    UpstreamUnavailable(String),

    /// Cache could not be updated where the outcome depends on it (sign-out)
    #[error("Failed to invalidate cache")]
    CacheUnavailable,

    /// Request body exceeds `server.max_body_size`
    #[error("Payload Too Large")]
    PayloadTooLarge,
}

impl Rejection {
    /// HTTP status for this rejection
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken | Self::RevokedToken => StatusCode::UNAUTHORIZED,
            Self::NoMatchingRoute => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::CacheUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "message": self.to_string() }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
