//! Authorizing request pipeline
//!
//! Every proxied request passes the same stages:
//!
//! 1. reserved header cleanup ([`cleanup`])
//! 2. descriptor construction and metrics timing
//! 3. authentication through the configured [`Authenticator`]
//! 4. authorization against the entry policy
//! 5. result header injection and forwarding ([`forward`])
//!
//! Each stage either hands the request on or produces an [`Error`], which
//! the boundary in [`Gateway::handle`] logs and turns into a response. A
//! result that is not clearly an allow never reaches the backend.

pub mod cleanup;
pub mod forward;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::uri::PathAndQuery;
use axum::http::{Request, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::metrics::{GatewayMetrics, RequestTimer};
use crate::policy::Validator;
use crate::request::RequestDescriptor;
use cleanup::strip_reserved_headers;
use forward::{apply_result_headers, content_length, Backend};

/// Result field holding the decision
pub const ALLOW_FIELD: &str = "allow";

/// Result field holding a replacement path and query
pub const URL_FIELD: &str = "url";

/// Per-deployment pipeline settings
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Policy evaluated for every request
    pub entry_policy: String,
    /// Header parsed into the descriptor's auth section
    pub auth_header: String,
    /// Hand stripped reserved headers to the policy
    pub expose_blocked_headers: bool,
}

/// The request pipeline with its collaborators
pub struct Gateway {
    settings: GatewaySettings,
    authenticator: Authenticator,
    validator: Arc<dyn Validator>,
    backend: Arc<dyn Backend>,
    metrics: GatewayMetrics,
}

impl Gateway {
    /// Assemble a pipeline
    pub fn new(
        settings: GatewaySettings,
        authenticator: Authenticator,
        validator: Arc<dyn Validator>,
        backend: Arc<dyn Backend>,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            settings,
            authenticator,
            validator,
            backend,
            metrics,
        }
    }

    /// Configured identity provider
    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Run one request through every stage
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let (mut parts, body) = request.into_parts();

        let stripped =
            strip_reserved_headers(&mut parts.headers, self.settings.expose_blocked_headers);
        self.metrics.record_blocked_headers(stripped.count);
        if stripped.count > 0 {
            debug!(count = stripped.count, "Stripped reserved headers from request");
        }

        let mut descriptor = RequestDescriptor::from_parts(&parts, &self.settings.auth_header);
        descriptor.blocked_headers = stripped.captured;

        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let timer = RequestTimer::start(method.as_str());

        let response = match self.process(&mut descriptor, parts, body).await {
            Ok(response) => response,
            Err(e) => {
                let id = descriptor.id().unwrap_or_default();
                match &e {
                    Error::Unauthorized => {
                        warn!(method = %method, path = %path, id = %id, "Rejected credentials")
                    }
                    Error::Forbidden => {
                        info!(method = %method, path = %path, id = %id, "Denied by policy")
                    }
                    _ => error!(
                        method = %method,
                        path = %path,
                        id = %id,
                        error = %e,
                        "Request failed"
                    ),
                }
                e.into_response()
            }
        };

        let status = response.status();
        let response_size = content_length(response.headers());
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_secs = timer.elapsed_secs(),
            request_size = descriptor.request.size,
            response_size = ?response_size,
            id = ?descriptor.id(),
            "request completed"
        );
        timer.complete(
            &self.metrics,
            status.as_u16(),
            &path,
            descriptor.request.size,
            response_size,
        );
        response
    }

    async fn process(
        &self,
        descriptor: &mut RequestDescriptor,
        mut parts: Parts,
        body: Body,
    ) -> Result<Response> {
        self.authenticator
            .authenticate(descriptor, &parts.headers)
            .await?;

        let result = self.authorize(descriptor).await?;

        apply_result_headers(&mut parts.headers, &result);
        if let Some(url) = &descriptor.forward_url {
            let target = PathAndQuery::try_from(url.as_str())
                .map_err(|e| Error::InvalidPolicyResult(format!("invalid url {url}: {e}")))?;
            debug!(from = %parts.uri, to = %target, "Rewriting forward URL");
            parts.uri = Uri::from(target);
        }

        self.backend.forward(Request::from_parts(parts, body)).await
    }

    /// Evaluate the entry policy and record the decision on `descriptor`
    ///
    /// Returns the result fields of an allowing decision.
    async fn authorize(&self, descriptor: &mut RequestDescriptor) -> Result<Map<String, Value>> {
        let input = descriptor.to_input()?;
        let result = self
            .validator
            .validate(&self.settings.entry_policy, input)
            .await?
            .ok_or_else(|| Error::InvalidPolicyResult("policy produced no result".into()))?;

        let Value::Object(fields) = &result else {
            return Err(Error::InvalidPolicyResult(format!(
                "expected an object, got {result}"
            )));
        };
        let Some(allow) = fields.get(ALLOW_FIELD).and_then(Value::as_bool) else {
            return Err(Error::InvalidPolicyResult(format!(
                "`{ALLOW_FIELD}` is missing or not a boolean"
            )));
        };
        let fields = fields.clone();
        descriptor.result = Some(result);

        if !allow {
            return Err(Error::Forbidden);
        }

        match fields.get(URL_FIELD) {
            None | Some(Value::Null) => {}
            Some(Value::String(url)) if url.is_empty() => {}
            Some(Value::String(url)) => {
                validate_forward_url(url)?;
                descriptor.forward_url = Some(url.clone());
            }
            Some(other) => {
                return Err(Error::InvalidPolicyResult(format!(
                    "`{URL_FIELD}` must be a string, got {other}"
                )))
            }
        }

        Ok(fields)
    }
}

/// A rewrite target must stay on the backend origin
fn validate_forward_url(url: &str) -> Result<()> {
    if !url.starts_with('/') || url.starts_with("//") {
        return Err(Error::InvalidPolicyResult(format!(
            "url must be an origin-relative path, got {url}"
        )));
    }
    PathAndQuery::try_from(url)
        .map_err(|e| Error::InvalidPolicyResult(format!("invalid url {url}: {e}")))?;
    Ok(())
}

// ============================================================================
// Router
// ============================================================================

/// Router sending every path and method through `gateway`
pub fn proxy_router(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(proxy_handler).with_state(gateway)
}

async fn proxy_handler(State(gateway): State<Arc<Gateway>>, request: Request<Body>) -> Response {
    gateway.handle(request).await
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
