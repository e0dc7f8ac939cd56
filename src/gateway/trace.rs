//! Per-request trace IDs and request logging.
//!
//! A `TraceId` is a UUID v4 string prefixed with `"gw-"`, minted once per
//! inbound request by [`trace_middleware`], and:
//!
//! - Returned to the client as the `X-Trace-Id` response header.
//! - Forwarded to the backend as the `X-Trace-Id` request header.
//! - Attached to the `request` span for everything logged while handling it.
//!
//! The current ID lives in [`TRACE_ID`], a `tokio::task_local!` slot, so any
//! code in the request's call stack can read it with [`current`].

use std::time::Instant;

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::dispatch::TRACE_ID_HEADER;

tokio::task_local! {
    /// Task-local storage for the current request trace ID.
    pub static TRACE_ID: String;
}

/// Generate a new gateway trace ID: `"gw-<uuid-v4>"`.
#[must_use]
pub fn generate() -> String {
    format!("gw-{}", Uuid::new_v4())
}

/// Return the trace ID set for the current task, or `None` if none is set.
#[must_use]
pub fn current() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}

/// Run `future` with `trace_id` installed as the task-local trace ID.
pub async fn with_trace_id<F, T>(trace_id: String, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    TRACE_ID.scope(trace_id, future).await
}

/// Assign a trace ID, log the request outcome and echo the ID to the client.
pub async fn trace_middleware(request: Request, next: Next) -> Response {
    let trace_id = generate();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = info_span!("request", trace_id = %trace_id, method = %method, path = %path);
    let started = Instant::now();

    let mut response = with_trace_id(trace_id.clone(), next.run(request))
        .instrument(span.clone())
        .await;

    let status = response.status();
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    span.in_scope(|| {
        if status.is_server_error() {
            warn!(status = status.as_u16(), latency_ms, "Request failed");
        } else {
            info!(status = status.as_u16(), latency_ms, "Request completed");
        }
    });

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, http::StatusCode, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn generate_returns_gw_prefixed_uuid_v4() {
        let id = generate();
        let uuid_part = id.strip_prefix("gw-").expect("prefix must be 'gw-'");
        let uuid = Uuid::parse_str(uuid_part).expect("UUID part must parse");
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn generate_produces_unique_ids() {
        assert_ne!(generate(), generate());
    }

    #[tokio::test]
    async fn current_is_none_outside_scope() {
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn current_returns_id_inside_scope() {
        let id = generate();
        let found = with_trace_id(id.clone(), async { current() }).await;
        assert_eq!(found, Some(id));
    }

    #[tokio::test]
    async fn middleware_exposes_id_to_handler_and_client() {
        // GIVEN: a handler that echoes the task-local trace ID
        let app = Router::new()
            .route("/", get(|| async { current().unwrap_or_default() }))
            .layer(middleware::from_fn(trace_middleware));

        // WHEN
        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // THEN: the header and the handler saw the same ID
        assert_eq!(response.status(), StatusCode::OK);
        let header = response.headers()[TRACE_ID_HEADER].to_str().unwrap().to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(header.starts_with("gw-"));
        assert_eq!(String::from_utf8_lossy(&body), header);
    }
}
