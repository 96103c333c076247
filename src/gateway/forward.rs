//! Forwarding of authorized requests to the backend
//!
//! The policy result travels with the request as headers under
//! [`RESERVED_PREFIX`]: every result field becomes one header, with
//! underscores in the field name turned into hyphens.
//!
//! # Dependency Injection
//!
//! [`Backend`] abstracts the transport; [`HttpBackend`] streams requests and
//! responses through reqwest. Tests inject a mock.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::response::Response;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::cleanup::RESERVED_PREFIX;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Connection-scoped headers never passed through the proxy
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ============================================================================
// Result headers
// ============================================================================

/// Header form of a policy result value
///
/// Strings pass through, arrays are joined with commas, everything else is
/// rendered as JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Header name carrying result field `key`
pub fn result_header_name(key: &str) -> String {
    format!("{}{}", RESERVED_PREFIX, key.replace('_', "-"))
}

/// Set one reserved header per non-empty result field
///
/// Fields whose name or rendered value is not a valid header are skipped.
pub fn apply_result_headers(headers: &mut HeaderMap, result: &Map<String, Value>) {
    for (key, value) in result {
        let rendered = render_value(value);
        if rendered.is_empty() {
            continue;
        }

        let name = result_header_name(key);
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(rendered.as_str()),
        ) else {
            warn!(field = %key, "Skipping policy result field not representable as a header");
            continue;
        };
        headers.insert(name, value);
    }
}

/// Remove connection-scoped headers
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Body length announced by `headers`, if any
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// ============================================================================
// Backend
// ============================================================================

/// Transport to the protected backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Send `request` (origin-form URI) to the backend and return its response
    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>>;
}

/// Timeouts for [`HttpBackend`]
#[derive(Debug, Clone, Copy)]
pub struct BackendTimeouts {
    /// Whole exchange
    pub request: Duration,
    /// Connection establishment
    pub connect: Duration,
    /// Idle pooled connections
    pub idle: Duration,
}

/// [`Backend`] over HTTP with streamed bodies
pub struct HttpBackend {
    origin: String,
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend forwarding to `origin` (scheme, host and port)
    pub fn new(origin: impl Into<String>, timeouts: BackendTimeouts) -> Result<Self> {
        Ok(Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(timeouts.request)
                .connect_timeout(timeouts.connect)
                .pool_idle_timeout(timeouts.idle)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?,
        })
    }

    /// Backend origin
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.origin, target);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        debug!(method = %parts.method, url = %url, "Forwarding to backend");

        let mut builder = self.http_client.request(parts.method, &url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = builder
            .send()
            .await
            .map_err(|e| Error::BadGateway(format!("Failed to reach backend: {}", e)))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
