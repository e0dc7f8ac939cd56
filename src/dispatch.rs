//! Forwarding authorized requests to backend services.
//!
//! A single-shot reverse proxy: the request path is appended to the target's
//! base path, method, headers, query and body are copied, and the backend
//! response is streamed back unchanged apart from hop-by-hop headers. No
//! retries and no redirect following.

use std::net::IpAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use bytes::Bytes;
use tracing::{debug, warn};
use url::Url;

use crate::error::Rejection;

/// Header carrying the per-request trace ID
pub const TRACE_ID_HEADER: &str = "x-trace-id";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers meaningful only for a single transport hop (RFC 9110 §7.6.1)
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Why a request could not be forwarded
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Route target is not an absolute http(s) URL
    #[error("invalid target URL '{0}'")]
    InvalidTarget(String),

    /// Request body exceeded the configured limit or could not be read
    #[error("request body too large")]
    BodyTooLarge,

    /// Backend sent no response headers within the upstream timeout
    #[error("backend did not respond within {0:?}")]
    TimedOut(Duration),

    /// Backend could not be reached
    #[error("backend unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

impl From<DispatchError> for Rejection {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidTarget(_) => Self::UpstreamUnavailable("Invalid target URL".to_string()),
            DispatchError::BodyTooLarge => Self::PayloadTooLarge,
            DispatchError::TimedOut(_) => Self::UpstreamUnavailable("Backend timed out".to_string()),
            DispatchError::Unreachable(e) if e.is_timeout() => {
                Self::UpstreamUnavailable("Backend timed out".to_string())
            }
            DispatchError::Unreachable(_) => Self::UpstreamUnavailable("Backend unreachable".to_string()),
        }
    }
}

/// Per-request forwarding metadata
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    /// Address of the connecting client
    pub client_ip: Option<IpAddr>,
    /// Trace ID to propagate
    pub trace_id: Option<String>,
}

/// HTTP forwarder shared by all request handlers
pub struct Dispatcher {
    http: reqwest::Client,
    /// Deadline for connecting and receiving response headers
    timeout: Duration,
    max_body_size: usize,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `timeout` bounds connecting and waiting for the response headers.
    /// Streaming the response body is not bounded here.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Unreachable`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration, max_body_size: usize) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            timeout,
            max_body_size,
        })
    }

    /// Forward `request` to `target` and relay the backend response.
    pub async fn forward(
        &self,
        request: Request,
        target: &str,
        ctx: &ForwardContext,
    ) -> Result<Response, DispatchError> {
        let (parts, body) = request.into_parts();
        let url = upstream_url(target, parts.uri.path(), parts.uri.query())?;

        let body: Bytes = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|_| DispatchError::BodyTooLarge)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if let Some(ip) = ctx.client_ip {
            append_forwarded_for(&mut headers, ip);
        }
        if let Some(value) = ctx.trace_id.as_deref().and_then(|id| HeaderValue::from_str(id).ok()) {
            headers.insert(TRACE_ID_HEADER, value);
        }

        debug!(method = %parts.method, url = %url, "Forwarding request");

        let send = self
            .http
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send();
        let upstream = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                warn!(backend = %target, timeout = ?self.timeout, "Backend did not respond in time");
                DispatchError::TimedOut(self.timeout)
            })?
            .inspect_err(|e| warn!(backend = %target, error = %e, "Backend request failed"))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Join `path` and `query` onto the base `target` URL.
///
/// # Errors
///
/// Returns [`DispatchError::InvalidTarget`] unless `target` is an absolute
/// `http` or `https` URL.
pub fn upstream_url(target: &str, path: &str, query: Option<&str>) -> Result<Url, DispatchError> {
    let mut url = Url::parse(target).map_err(|_| DispatchError::InvalidTarget(target.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(DispatchError::InvalidTarget(target.to_string()));
    }

    let joined = join_paths(url.path(), path);
    url.set_path(&joined);

    let merged = match (url.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(base), Some(extra)) => Some(format!("{base}&{extra}")),
        (Some(base), None) => Some(base.to_string()),
        (None, extra) => extra.map(str::to_string),
    };
    url.set_query(merged.as_deref());
    Ok(url)
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {ip}"),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
