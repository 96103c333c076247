//! Application context and listeners
//!
//! [`Application`] is built once from the [`Config`] and owns every
//! long-lived component: the policy cache, the identity provider, the
//! backend client and the metrics instruments. [`Application::run`] serves
//! two listeners until the shutdown token fires:
//!
//! - the proxy listener, routing every path through the [`Gateway`]
//! - the management listener:
//!   - `GET /healthz`, `GET /readyz` - 200 once the entry policy compiled, 424 before
//!   - `GET /version` - build version
//!   - `GET /config` - names of the compiled policies
//!   - `GET /metrics` - gateway metrics in the Prometheus text format

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::jwks::HttpJwksFetcher;
use crate::auth::tenant::GraphLookup;
use crate::auth::{AuthMode, Authenticator, JwksConfig, JwksProvider, TenantConfig, TenantProvider};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filecache::FileCache;
use crate::gateway::forward::{BackendTimeouts, HttpBackend};
use crate::gateway::{proxy_router, Gateway, GatewaySettings};
use crate::metrics::{GatewayMetrics, MetricsRegistry};
use crate::policy::{PolicyCache, RegorusEngine};

/// Long-lived components of a running gateway
pub struct Application {
    config: Config,
    policy: PolicyCache,
    metrics: MetricsRegistry,
    gateway: Arc<Gateway>,
}

impl Application {
    /// Validate `config` and construct every component
    ///
    /// With JWKS authentication this fetches the discovery documents and key
    /// sets, so it fails when no issuer is reachable.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let files = FileCache::new(&config.policy_dir, &config.file_pattern)?;
        let policy = PolicyCache::new(
            files,
            Arc::new(RegorusEngine::new(config.debug)),
            config.request_policy.clone(),
            config.debug,
        );

        let authenticator = build_authenticator(&config).await?;
        info!(provider = authenticator.name(), "Authentication configured");

        let backend = HttpBackend::new(
            config.backend_origin(),
            BackendTimeouts {
                request: Duration::from_secs(config.backend_timeout_secs),
                connect: Duration::from_secs(config.backend_connect_timeout_secs),
                idle: Duration::from_secs(config.backend_idle_timeout_secs),
            },
        )?;
        info!(backend = %backend.origin(), "Backend configured");

        let metrics = MetricsRegistry::new()?;

        let gateway = Gateway::new(
            GatewaySettings {
                entry_policy: config.request_policy.clone(),
                auth_header: config.auth_header.clone(),
                expose_blocked_headers: config.expose_blocked_headers,
            },
            authenticator,
            Arc::new(policy.clone()),
            Arc::new(backend),
            GatewayMetrics::new(&metrics.meter(), config.expose_blocked_headers),
        );

        Ok(Self {
            config,
            policy,
            metrics,
            gateway: Arc::new(gateway),
        })
    }

    /// Policy cache shared with the pipeline
    pub fn policy(&self) -> &PolicyCache {
        &self.policy
    }

    /// Registry behind `GET /metrics`
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Serve until `shutdown` is cancelled or a listener fails
    ///
    /// After cancellation in-flight requests get the configured grace period;
    /// requests still running after it are dropped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.policy.watch()?;
        if !self.policy.ready() {
            warn!(policy = %self.policy.entry_policy(), "Entry policy not compiled, not ready");
        }

        let refresh = match self.gateway.authenticator() {
            Authenticator::Jwks(provider) => provider.spawn_refresh(shutdown.clone()),
            Authenticator::Tenant(_) => Vec::new(),
        };

        let proxy = bind(self.config.listen).await?;
        let management = bind(self.config.management).await?;
        info!(addr = %self.config.listen, "Proxy listening");
        info!(addr = %self.config.management, "Management listening");

        let proxy = axum::serve(proxy, proxy_router(Arc::clone(&self.gateway)))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future();
        let management_routes = management_router(self.policy.clone(), self.metrics.clone());
        let management = axum::serve(management, management_routes)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future();
        let mut servers = tokio::spawn(async move { tokio::try_join!(proxy, management) });

        let result = tokio::select! {
            joined = &mut servers => flatten(joined),
            _ = shutdown.cancelled() => {
                info!(
                    timeout_secs = self.config.shutdown_timeout_secs,
                    "Shutting down, draining in-flight requests"
                );
                match tokio::time::timeout(self.config.shutdown_timeout(), &mut servers).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        warn!("Shutdown grace period elapsed, dropping remaining requests");
                        servers.abort();
                        Ok(())
                    }
                }
            }
        };

        shutdown.cancel();
        self.policy.close();
        for task in refresh {
            let _ = task.await;
        }
        info!("Gateway stopped");
        result
    }
}

async fn build_authenticator(config: &Config) -> Result<Authenticator> {
    let mode = AuthMode::from_permissive(config.permissive_auth);

    if let Some(tenant) = config.azure_tenant.as_deref().filter(|t| !t.is_empty()) {
        let lookup = GraphLookup::new(config.graph_url.clone(), config.identity_timeout())?;
        let provider = TenantProvider::new(
            TenantConfig {
                tenant: tenant.to_string(),
                auth_header: config.auth_header.clone(),
                auth_kind: config.auth_kind.clone(),
                mode,
            },
            Arc::new(lookup),
        );
        return Ok(Authenticator::Tenant(provider));
    }

    let fetcher = HttpJwksFetcher::new(config.identity_timeout())?;
    let provider = JwksProvider::discover(
        JwksConfig {
            well_known: config.well_known.clone(),
            audiences: config.audiences(),
            audience_claim: config.audience_claim.clone(),
            auth_header: config.auth_header.clone(),
            auth_kind: config.auth_kind.clone(),
            mode,
        },
        Arc::new(fetcher),
    )
    .await?;
    Ok(Authenticator::Jwks(provider))
}

async fn bind(addr: std::net::SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))
}

fn flatten(
    joined: std::result::Result<std::io::Result<((), ())>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(Error::Internal(format!("server error: {e}"))),
        Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
    }
}

// ============================================================================
// Management endpoints
// ============================================================================

#[derive(Clone)]
struct Management {
    policy: PolicyCache,
    metrics: MetricsRegistry,
}

/// Router for health, readiness, info and metrics endpoints
pub fn management_router(policy: PolicyCache, metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/healthz", get(readiness))
        .route("/readyz", get(readiness))
        .route("/version", get(version))
        .route("/config", get(policies))
        .route("/metrics", get(render_metrics))
        .with_state(Management { policy, metrics })
}

async fn readiness(State(state): State<Management>) -> Response {
    if state.policy.ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::FAILED_DEPENDENCY, "entry policy not compiled").into_response()
    }
}

async fn version() -> Json<Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

async fn policies(State(state): State<Management>) -> Json<Value> {
    Json(json!({"policies": state.policy.info()}))
}

async fn render_metrics(State(state): State<Management>) -> Result<Response> {
    let text = state.metrics.encode_text()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}
