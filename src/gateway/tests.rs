use super::*;

use axum::http::{header, HeaderMap, StatusCode};
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::auth::tenant::{LookupError, MockAppLookup};
use crate::auth::{AuthMode, TenantConfig, TenantProvider};
use crate::filecache::FileCache;
use crate::metrics::MetricsRegistry;
use crate::policy::{MockValidator, PolicyCache, RegorusEngine};
use forward::MockBackend;

const TENANT: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";

const ENTRY_POLICY: &str = r#"package regate.request

import rego.v1

default allow := false

allow if {
    input.request.id == "X"
}

role := "writer" if allow
"#;

// ============================================================================
// Fixtures
// ============================================================================

fn app_token(app_id: &str) -> String {
    encode(
        &Header::default(),
        &json!({"appid": app_id, "tid": TENANT}),
        &EncodingKey::from_secret(b"not-checked"),
    )
    .unwrap()
}

fn authenticator(mode: AuthMode, lookup: MockAppLookup) -> Authenticator {
    Authenticator::Tenant(TenantProvider::new(
        TenantConfig {
            tenant: TENANT.into(),
            auth_header: "Authorization".into(),
            auth_kind: "bearer".into(),
            mode,
        },
        Arc::new(lookup),
    ))
}

fn resolving_lookup() -> MockAppLookup {
    let mut lookup = MockAppLookup::new();
    lookup.expect_lookup().returning(|app_id, _| {
        let mut record = Map::new();
        record.insert("appId".into(), json!(app_id));
        Ok(record)
    });
    lookup
}

fn settings(expose_blocked_headers: bool) -> GatewaySettings {
    GatewaySettings {
        entry_policy: "request.rego".into(),
        auth_header: "Authorization".into(),
        expose_blocked_headers,
    }
}

type Forwarded = Arc<Mutex<Option<Parts>>>;

/// Backend answering 200 and remembering what it received
fn recording_backend() -> (MockBackend, Forwarded) {
    let forwarded: Forwarded = Arc::default();
    let sink = Arc::clone(&forwarded);

    let mut backend = MockBackend::new();
    backend.expect_forward().returning(move |request| {
        let (parts, _) = request.into_parts();
        *sink.lock() = Some(parts);
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, "2")
            .body(Body::from("ok"))
            .unwrap())
    });
    (backend, forwarded)
}

fn unreachable_backend() -> MockBackend {
    let mut backend = MockBackend::new();
    backend.expect_forward().never();
    backend
}

fn validator_returning(result: Option<Value>) -> MockValidator {
    let mut validator = MockValidator::new();
    validator
        .expect_validate()
        .returning(move |_, _| Ok(result.clone()));
    validator
}

fn gateway(
    settings: GatewaySettings,
    authenticator: Authenticator,
    validator: Arc<dyn Validator>,
    backend: MockBackend,
) -> Gateway {
    Gateway::new(
        settings,
        authenticator,
        validator,
        Arc::new(backend),
        GatewayMetrics::new(&MetricsRegistry::new().unwrap().meter(), false),
    )
}

fn request(token: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::builder().method("GET").uri("/api/items?page=2");
    match token {
        Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
        None => builder,
    }
}

fn policy_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("request.rego"), ENTRY_POLICY).unwrap();
    dir
}

fn policy_cache(dir: &TempDir) -> Arc<PolicyCache> {
    let files = FileCache::new(dir.path(), "*.rego").unwrap();
    Arc::new(PolicyCache::new(
        files,
        Arc::new(RegorusEngine::default()),
        "request.rego",
        false,
    ))
}

// ============================================================================
// Decisions with a real policy
// ============================================================================

#[tokio::test]
async fn test_allowed_identity_is_forwarded() {
    let dir = policy_dir();
    let (backend, forwarded) = recording_backend();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, resolving_lookup()),
        policy_cache(&dir),
        backend,
    );

    let token = app_token("X");
    let response = gateway
        .handle(request(Some(&token)).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let parts = forwarded.lock().take().unwrap();
    assert_eq!(parts.uri.path_and_query().unwrap(), "/api/items?page=2");
    assert_eq!(parts.headers.get("x-regate-allow").unwrap(), "true");
    assert_eq!(parts.headers.get("x-regate-role").unwrap(), "writer");
}

#[tokio::test]
async fn test_other_identity_is_denied() {
    let dir = policy_dir();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, resolving_lookup()),
        policy_cache(&dir),
        unreachable_backend(),
    );

    let token = app_token("Y");
    let response = gateway
        .handle(request(Some(&token)).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_entry_policy_fails_closed() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, resolving_lookup()),
        policy_cache(&dir),
        unreachable_backend(),
    );

    let token = app_token("X");
    let response = gateway
        .handle(request(Some(&token)).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_broken_policy_is_internal_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("request.rego"), "allow := true\n").unwrap();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, resolving_lookup()),
        policy_cache(&dir),
        unreachable_backend(),
    );

    let response = gateway
        .handle(request(None).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

// ============================================================================
// Result validation
// ============================================================================

#[tokio::test]
async fn test_non_conforming_results_never_forward() {
    for result in [
        None,
        Some(json!(true)),
        Some(json!([{"allow": true}])),
        Some(json!({})),
        Some(json!({"allow": "true"})),
        Some(json!({"allow": 1})),
        Some(json!({"allow": null})),
    ] {
        let gateway = gateway(
            settings(false),
            authenticator(AuthMode::Strict, MockAppLookup::new()),
            Arc::new(validator_returning(result.clone())),
            unreachable_backend(),
        );

        let response = gateway
            .handle(request(None).body(Body::empty()).unwrap())
            .await;
        assert_eq!(
            response.status(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "result {result:?} was not rejected"
        );
    }
}

#[tokio::test]
async fn test_evaluation_error_is_internal_error() {
    let mut validator = MockValidator::new();
    validator
        .expect_validate()
        .returning(|_, _| Err(Error::PolicyEval("undefined function".into())));
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator),
        unreachable_backend(),
    );

    let response = gateway
        .handle(request(None).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_url_rewrite() {
    let (backend, forwarded) = recording_backend();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator_returning(Some(
            json!({"allow": true, "url": "/v2/items?page=2&sort=asc"}),
        ))),
        backend,
    );

    let response = gateway
        .handle(request(None).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let parts = forwarded.lock().take().unwrap();
    assert_eq!(
        parts.uri.path_and_query().unwrap(),
        "/v2/items?page=2&sort=asc"
    );
    assert_eq!(
        parts.headers.get("x-regate-url").unwrap(),
        "/v2/items?page=2&sort=asc"
    );
}

#[tokio::test]
async fn test_invalid_rewrite_targets() {
    for url in [
        json!("https://elsewhere.example.com/"),
        json!("//elsewhere.example.com/x"),
        json!("relative/path"),
        json!("/with space"),
        json!(42),
    ] {
        let gateway = gateway(
            settings(false),
            authenticator(AuthMode::Strict, MockAppLookup::new()),
            Arc::new(validator_returning(Some(json!({"allow": true, "url": url.clone()})))),
            unreachable_backend(),
        );

        let response = gateway
            .handle(request(None).body(Body::empty()).unwrap())
            .await;
        assert_eq!(
            response.status(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "url {url} was accepted"
        );
    }
}

#[tokio::test]
async fn test_denial_ignores_url() {
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator_returning(Some(json!({"allow": false, "url": 42})))),
        unreachable_backend(),
    );

    let response = gateway
        .handle(request(None).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ============================================================================
// Reserved headers
// ============================================================================

fn spoofing_request() -> Request<Body> {
    Request::builder()
        .uri("/")
        .header("x-regate-allow", "true")
        .header("X-Regate-Role", "admin")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_spoofed_headers_exposed_to_policy() {
    let mut validator = MockValidator::new();
    validator
        .expect_validate()
        .withf(|_, input| {
            input["blocked_headers"]["X-Regate-Role"] == json!("admin")
                && input["request"]["headers"].get("X-Regate-Role").is_none()
        })
        .times(1)
        .returning(|_, _| Ok(Some(json!({"allow": true}))));

    let (backend, forwarded) = recording_backend();
    let gateway = gateway(
        settings(true),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator),
        backend,
    );

    let response = gateway.handle(spoofing_request()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let parts = forwarded.lock().take().unwrap();
    assert!(parts.headers.get("x-regate-role").is_none());
    // Only the gateway's own decision header remains
    assert_eq!(parts.headers.get("x-regate-allow").unwrap(), "true");
}

#[tokio::test]
async fn test_spoofed_headers_dropped_silently() {
    let mut validator = MockValidator::new();
    validator
        .expect_validate()
        .withf(|_, input| {
            input.get("blocked_headers").is_none()
                && input["request"]["headers"].get("X-Regate-Role").is_none()
        })
        .times(1)
        .returning(|_, _| Ok(Some(json!({"allow": true}))));

    let (backend, forwarded) = recording_backend();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator),
        backend,
    );

    let response = gateway.handle(spoofing_request()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let parts = forwarded.lock().take().unwrap();
    assert!(parts.headers.get("x-regate-role").is_none());
}

// ============================================================================
// Authentication outcomes
// ============================================================================

#[tokio::test]
async fn test_strict_rejection_is_unauthorized() {
    let mut validator = MockValidator::new();
    validator.expect_validate().never();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator),
        unreachable_backend(),
    );

    let response = gateway
        .handle(request(Some("garbage")).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );
}

#[tokio::test]
async fn test_permissive_rejection_reaches_policy_anonymously() {
    let mut validator = MockValidator::new();
    validator
        .expect_validate()
        .withf(|_, input| input.get("user").is_none() && input["request"].get("id").is_none())
        .times(1)
        .returning(|_, _| Ok(Some(json!({"allow": true}))));

    let (backend, _) = recording_backend();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Permissive, MockAppLookup::new()),
        Arc::new(validator),
        backend,
    );

    let response = gateway
        .handle(request(Some("garbage")).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_lookup_outage_is_unavailable_in_both_modes() {
    for mode in [AuthMode::Strict, AuthMode::Permissive] {
        let mut lookup = MockAppLookup::new();
        lookup
            .expect_lookup()
            .returning(|_, _| Err(LookupError::Transport("timed out".into())));
        let mut validator = MockValidator::new();
        validator.expect_validate().never();

        let gateway = gateway(
            settings(false),
            authenticator(mode, lookup),
            Arc::new(validator),
            unreachable_backend(),
        );

        let token = app_token("X");
        let response = gateway
            .handle(request(Some(&token)).body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{mode:?}");
    }
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_backend_failure_is_bad_gateway() {
    let mut backend = MockBackend::new();
    backend
        .expect_forward()
        .returning(|_| Err(Error::BadGateway("connection refused".into())));
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator_returning(Some(json!({"allow": true})))),
        backend,
    );

    let response = gateway
        .handle(request(None).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_result_fields_become_headers() {
    let (backend, forwarded) = recording_backend();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator_returning(Some(json!({
            "allow": true,
            "user_roles": ["reader", "auditor"],
            "quota": 10,
            "scope": {"team": "payments"},
            "expires": null,
        })))),
        backend,
    );

    gateway
        .handle(request(None).body(Body::empty()).unwrap())
        .await;

    let headers: HeaderMap = forwarded.lock().take().unwrap().headers;
    assert_eq!(headers.get("x-regate-user-roles").unwrap(), "reader,auditor");
    assert_eq!(headers.get("x-regate-quota").unwrap(), "10");
    assert_eq!(headers.get("x-regate-scope").unwrap(), r#"{"team":"payments"}"#);
    assert_eq!(headers.get("x-regate-expires").unwrap(), "null");
}

#[tokio::test]
async fn test_router_proxies_any_path() {
    let (backend, forwarded) = recording_backend();
    let gateway = gateway(
        settings(false),
        authenticator(AuthMode::Strict, MockAppLookup::new()),
        Arc::new(validator_returning(Some(json!({"allow": true})))),
        backend,
    );

    let response = proxy_router(Arc::new(gateway))
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/deeply/nested/resource/7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"ok");

    let parts = forwarded.lock().take().unwrap();
    assert_eq!(parts.method, "DELETE");
    assert_eq!(parts.uri.path(), "/deeply/nested/resource/7");
}
