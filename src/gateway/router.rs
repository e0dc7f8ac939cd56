//! HTTP router and handlers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::auth::{Authenticator, bearer_token};
use super::trace;
use crate::authz::{Decision, authorize};
use crate::dispatch::{Dispatcher, ForwardContext};
use crate::error::Rejection;
use crate::keyset::KeySetManager;
use crate::registry::RouteRegistry;

/// Shared application state
pub struct AppState {
    /// Route table
    pub registry: Arc<RouteRegistry>,
    /// Token authentication (cache + validator)
    pub authenticator: Authenticator,
    /// Backend forwarder
    pub dispatcher: Dispatcher,
    /// Signing keys, for `/health`
    pub keys: Arc<KeySetManager>,
    /// Path whose `POST` signs the caller out
    pub sign_out_path: String,
    /// Whole-request deadline
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let sign_out_path = state.sign_out_path.clone();
    let request_timeout = state.request_timeout;

    Router::new()
        .route("/health", get(health_handler))
        .route(
            &sign_out_path,
            post(sign_out_handler).fallback(gateway_handler),
        )
        .fallback(gateway_handler)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(trace::trace_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let keys = state.keys.snapshot();
    let cache = state.authenticator.cache().map(|c| c.stats());

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": state.registry.len(),
        "keys": {
            "count": keys.len(),
            "refreshed_at": keys.refreshed_at(),
        },
        "cache": cache,
    }))
}

/// Route, authenticate, authorize, then forward.
async fn gateway_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match pipeline(&state, request).await {
        Ok(response) => response,
        Err(rejection) => rejection.into_response(),
    }
}

async fn pipeline(state: &AppState, request: Request) -> Result<Response, Rejection> {
    let path = request.uri().path().to_string();
    let route = state.registry.resolve(&path).ok_or_else(|| {
        debug!(path = %path, "No route matches");
        Rejection::NoMatchingRoute
    })?;

    if !route.is_public() {
        let token = bearer_token(request.headers()).ok_or_else(|| {
            warn!(path = %path, "Missing bearer token");
            Rejection::MissingToken
        })?;
        let claims = state.authenticator.authenticate(token).await?;

        if authorize(&route.required_roles, &claims.roles) == Decision::Forbidden {
            warn!(
                subject = %claims.subject,
                path = %path,
                pattern = %route.pattern,
                "Caller lacks a required role"
            );
            return Err(Rejection::Forbidden);
        }
        debug!(subject = %claims.subject, service = %route.service, "Request authorized");
    }

    let ctx = forward_context(&request);
    Ok(state.dispatcher.forward(request, &route.target, &ctx).await?)
}

/// POST <sign-out path>: drop the caller's cached claims, then forward.
async fn sign_out_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match sign_out(&state, request).await {
        Ok(response) => response,
        Err(rejection) => rejection.into_response(),
    }
}

async fn sign_out(state: &AppState, request: Request) -> Result<Response, Rejection> {
    let token = bearer_token(request.headers()).ok_or(Rejection::MissingToken)?;
    state.authenticator.sign_out(token).await?;
    debug!("Signed out; cached claims removed");

    let route = state
        .registry
        .resolve(request.uri().path())
        .ok_or(Rejection::NoMatchingRoute)?;
    let ctx = forward_context(&request);
    Ok(state.dispatcher.forward(request, &route.target, &ctx).await?)
}

fn forward_context(request: &Request) -> ForwardContext {
    ForwardContext {
        client_ip: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
        trace_id: trace::current(),
    }
}
