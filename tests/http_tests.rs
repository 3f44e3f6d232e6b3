//! HTTP surface tests
//!
//! Exercises the router built by `TokenService` (middleware included):
//! - Token exchange over form and JSON bodies
//! - Error status mapping and cache headers
//! - JWKS discovery and probes
//! - Admin key operations and their authentication

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use serde_json::{Map, Value, json};
use tower::ServiceExt;

use sts::config::{Config, TrustedIssuerConfig};
use sts::exchange::{
    AudienceRule, InMemoryKeyStore, KeyManager, KeyManagerSettings, TokenMinter, TokenType,
    GRANT_TYPE_TOKEN_EXCHANGE,
};
use sts::server::TokenService;

const IDP: &str = "https://idp.example.com";
const ADMIN: &str = "admin-secret";

struct TestApp {
    router: Router,
    service: TokenService,
    idp: TokenMinter,
}

async fn app_with(adjust: impl FnOnce(&mut Config)) -> TestApp {
    let idp_keys = Arc::new(KeyManager::new(
        Arc::new(InMemoryKeyStore::new()),
        KeyManagerSettings::default(),
    ));
    idp_keys.initialize().await.unwrap();

    let mut config = Config::default();
    config.trust.issuers.push(TrustedIssuerConfig {
        issuer: IDP.to_string(),
        jwks_uri: None,
        jwks: Some(idp_keys.jwks()),
        jwks_file: None,
    });
    config.policy.audiences.push(AudienceRule {
        issuer: IDP.to_string(),
        source_audience: "*".to_string(),
        targets: vec!["orders-api".to_string()],
        default_audience: None,
    });
    config.admin.bearer_token = Some(ADMIN.to_string());
    adjust(&mut config);
    config.validate().unwrap();

    let service = TokenService::new(config).await.unwrap();
    TestApp {
        router: service.router(),
        service,
        idp: TokenMinter::new(idp_keys, IDP, Duration::from_secs(600)),
    }
}

async fn app() -> TestApp {
    app_with(|_| {}).await
}

fn subject_token(app: &TestApp) -> String {
    let claims: Map<String, Value> = json!({"sub": "alice", "aud": "gateway", "scope": "orders:read profile"})
        .as_object()
        .unwrap()
        .clone();
    app.idp.mint(&claims, None).unwrap().serialized_token
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, headers, body)
}

fn form_exchange(fields: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/token/exchange")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(serde_urlencoded::to_string(fields).unwrap()))
        .unwrap()
}

fn json_exchange(body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/token/exchange")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn admin(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

/// Test a form-encoded exchange returns an uncacheable token response
#[tokio::test]
async fn test_form_exchange_succeeds() {
    let app = app().await;
    let token = subject_token(&app);

    let (status, headers, body) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", token.as_str()),
            ("subject_token_type", TokenType::Jwt.urn()),
            ("audience", "orders-api"),
            ("scope", "orders:read"),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");
    assert_eq!(headers[header::PRAGMA], "no-cache");
    assert_eq!(body["issued_token_type"], TokenType::Jwt.urn());
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 3600);
    assert_eq!(body["scope"], "orders:read");
    assert!(body["access_token"].as_str().unwrap().split('.').count() == 3);
}

/// Test a JSON body is accepted
#[tokio::test]
async fn test_json_exchange_succeeds() {
    let app = app().await;
    let (status, _, body) = send(
        &app.router,
        json_exchange(&json!({
            "grant_type": GRANT_TYPE_TOKEN_EXCHANGE,
            "subject_token": subject_token(&app),
            "subject_token_type": TokenType::Jwt.urn(),
            "audience": "orders-api",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "orders:read profile");
}

/// Test a wrong grant type is a 400 invalid_request
#[tokio::test]
async fn test_wrong_grant_type() {
    let app = app().await;
    let (status, headers, body) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", "client_credentials"),
            ("subject_token", "a.b.c"),
            ("subject_token_type", TokenType::Jwt.urn()),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");
}

/// Test an actor token without its type never reaches verification
#[tokio::test]
async fn test_actor_without_type() {
    let app = app().await;
    let (status, _, body) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", "a.b.c"),
            ("subject_token_type", TokenType::Jwt.urn()),
            ("actor_token", "x.y.z"),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

/// Test a garbage subject token is invalid_grant with the default 400 status
#[tokio::test]
async fn test_invalid_subject_token_default_status() {
    let app = app().await;
    let (status, _, body) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", "not-a-jwt"),
            ("subject_token_type", TokenType::Jwt.urn()),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_grant");
}

/// Test the invalid-token status is configurable
#[tokio::test]
async fn test_invalid_subject_token_configured_status() {
    let app = app_with(|c| c.token.invalid_token_status = 401).await;
    let (status, _, body) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", "not-a-jwt"),
            ("subject_token_type", TokenType::Jwt.urn()),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_grant");
}

/// Test scope escalation is a 403 access_denied
#[tokio::test]
async fn test_scope_escalation_forbidden() {
    let app = app().await;
    let token = subject_token(&app);
    let (status, _, body) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", token.as_str()),
            ("subject_token_type", TokenType::Jwt.urn()),
            ("audience", "orders-api"),
            ("scope", "orders:read orders:delete"),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "access_denied");
    assert!(body.get("access_token").is_none());
}

/// Test oversized bodies are rejected by the body limit
#[tokio::test]
async fn test_body_limit() {
    let app = app_with(|c| c.server.max_body_size = 1024).await;
    let huge = "a".repeat(4096);
    let (status, _, _) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", huge.as_str()),
            ("subject_token_type", TokenType::Jwt.urn()),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

/// Test probes report liveness and readiness
#[tokio::test]
async fn test_probes() {
    let app = app().await;
    let (status, _, body) = send(&app.router, get("/livez")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, body) = send(&app.router, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

/// Test the JWKS lists the active key with a bounded cache lifetime
#[tokio::test]
async fn test_jwks_document() {
    let app = app().await;
    let (status, headers, body) = send(&app.router, get("/.well-known/jwks.json")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=150");
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    let active = app.service.keys().current_signing_key().unwrap();
    assert_eq!(keys[0]["kid"], json!(active.key_id));
    assert_eq!(keys[0]["alg"], "ES256");
    assert!(keys[0].get("d").is_none(), "private material must not be published");
}

/// Test admin routes are disabled without a configured token
#[tokio::test]
async fn test_admin_disabled_without_token() {
    let app = app_with(|c| c.admin.bearer_token = None).await;
    let (status, _, body) = send(
        &app.router,
        admin(Method::POST, "/admin/keys/rotate", Some("anything")),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "admin_not_configured");
}

/// Test admin routes reject a wrong or missing bearer token
#[tokio::test]
async fn test_admin_requires_bearer() {
    let app = app().await;
    for token in [None, Some("wrong")] {
        let (status, headers, body) =
            send(&app.router, admin(Method::POST, "/admin/keys/rotate", token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(body["error"], "unauthorized");
    }
}

/// Test rotate publishes a pending key and tick waits out the grace period
#[tokio::test]
async fn test_admin_rotate_and_tick() {
    let app = app().await;
    let active = app.service.keys().current_signing_key().unwrap().key_id;

    // WHEN: an operator rotates
    let (status, _, body) =
        send(&app.router, admin(Method::POST, "/admin/keys/rotate", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    let pending = body["pending_key_id"].as_str().unwrap().to_string();
    assert_ne!(pending, active);

    // THEN: both keys are published
    let (_, _, jwks) = send(&app.router, get("/.well-known/jwks.json")).await;
    let kids: Vec<&str> = jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|k| k["kid"].as_str())
        .collect();
    assert!(kids.contains(&active.as_str()));
    assert!(kids.contains(&pending.as_str()));

    // AND: a tick inside the grace period promotes nothing
    let (status, _, body) =
        send(&app.router, admin(Method::POST, "/admin/keys/tick", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["promoted"], Value::Null);
    assert_eq!(app.service.keys().current_signing_key().unwrap().key_id, active);
}

/// Test revoking the active key swaps in a replacement and unpublishes it
#[tokio::test]
async fn test_admin_revoke() {
    let app = app().await;
    let active = app.service.keys().current_signing_key().unwrap().key_id;

    let (status, _, _) = send(
        &app.router,
        admin(Method::DELETE, &format!("/admin/keys/{active}"), Some(ADMIN)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, _, jwks) = send(&app.router, get("/.well-known/jwks.json")).await;
    assert!(
        jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .all(|k| k["kid"] != json!(active))
    );
    let (status, _, _) = send(&app.router, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(
        &app.router,
        admin(Method::DELETE, "/admin/keys/no-such-key", Some(ADMIN)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "key_not_found");
}

/// Test tokens from this service can be exchanged again when self-trust is on
#[tokio::test]
async fn test_self_issued_token_is_exchangeable() {
    let app = app_with(|c| {
        c.policy.audiences.push(AudienceRule {
            issuer: c.issuer.clone(),
            source_audience: "orders-api".to_string(),
            targets: vec!["billing-api".to_string()],
            default_audience: Some("billing-api".to_string()),
        });
    })
    .await;
    let token = subject_token(&app);

    let (_, _, first) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", token.as_str()),
            ("subject_token_type", TokenType::Jwt.urn()),
            ("audience", "orders-api"),
        ]),
    )
    .await;
    let issued = first["access_token"].as_str().unwrap();

    let (status, _, second) = send(
        &app.router,
        form_exchange(&[
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", issued),
            ("subject_token_type", TokenType::Jwt.urn()),
            ("scope", "profile"),
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["scope"], "profile");
}
