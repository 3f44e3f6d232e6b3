//! HTTP handlers for the token service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/token/exchange` | RFC 8693 token exchange (form or JSON body) |
//! | `GET` | `/.well-known/jwks.json` | Published signing keys |
//! | `GET` | `/livez` | Liveness |
//! | `GET` | `/readyz` | Ready once an ACTIVE signing key exists |
//! | `POST` | `/admin/keys/rotate` | Generate a PENDING key (admin) |
//! | `POST` | `/admin/keys/tick` | Run one promotion/purge step (admin) |
//! | `DELETE` | `/admin/keys/{kid}` | Revoke a compromised key (admin) |
//!
//! ## Token Exchange
//!
//! ```text
//! POST /v1/token/exchange
//! Content-Type: application/x-www-form-urlencoded
//!
//! grant_type=urn:ietf:params:oauth:grant-type:token-exchange
//! &subject_token=<JWT>
//! &subject_token_type=urn:ietf:params:oauth:token-type:jwt
//! &audience=orders-api
//! &scope=orders:read
//! ```
//!
//! Failures return `{"error": ..., "error_description": ...}` with the
//! status of the error class. Descriptions never carry internal detail.
//!
//! ## Admin Authentication
//!
//! Admin endpoints require `Authorization: Bearer <admin_token>`. If no admin
//! token is configured they return `503 Service Unavailable`.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::json;
use tracing::warn;

use super::{
    ErrorClass, ExchangeError, KeyError, TokenExchangeEngine,
    request::{ExchangeRequest, TokenExchangeForm},
};

/// Shared state for all routes.
pub struct AppState {
    /// The exchange engine (and through it, the key manager).
    pub engine: Arc<TokenExchangeEngine>,
    /// Admin bearer token; admin routes are disabled when `None`.
    pub admin_token: Option<String>,
    /// Status for `invalid_grant` responses (400 or 401).
    pub invalid_token_status: StatusCode,
}

/// Build the service routes.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/token/exchange", post(exchange_token))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/admin/keys/rotate", post(rotate_keys))
        .route("/admin/keys/tick", post(tick_keys))
        .route("/admin/keys/{kid}", delete(revoke_key))
        .with_state(state)
}

// ── Token exchange ────────────────────────────────────────────────────────

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("application/json") || v.ends_with("+json")
        })
}

/// Decode the body as JSON or `application/x-www-form-urlencoded`.
fn parse_body(headers: &HeaderMap, body: &[u8]) -> Result<ExchangeRequest, String> {
    let form: TokenExchangeForm = if is_json(headers) {
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?
    } else {
        serde_urlencoded::from_bytes(body).map_err(|e| format!("invalid form body: {e}"))?
    };
    Ok(form.into())
}

/// `POST /v1/token/exchange`
async fn exchange_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match parse_body(&headers, &body) {
        Ok(request) => request,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", &message);
        }
    };

    match state.engine.exchange(&request).await {
        Ok(response) => no_store((StatusCode::OK, Json(response)).into_response()),
        Err(e) => exchange_error_response(&e, state.invalid_token_status),
    }
}

/// Map a classified failure to its HTTP response.
pub fn exchange_error_response(err: &ExchangeError, invalid_token_status: StatusCode) -> Response {
    let status = match err.class() {
        ErrorClass::RequestMalformed => StatusCode::BAD_REQUEST,
        ErrorClass::TokenInvalid => invalid_token_status,
        ErrorClass::PolicyDenied => StatusCode::FORBIDDEN,
        ErrorClass::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    no_store(error_response(
        status,
        err.error_code(),
        &err.public_description(),
    ))
}

/// Token responses must not be cached (RFC 6749 §5.1).
fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

// ── Discovery and probes ──────────────────────────────────────────────────

/// `GET /.well-known/jwks.json`
async fn jwks(State(state): State<Arc<AppState>>) -> Response {
    let keys = state.engine.keys();
    // Consumers must refetch well within the grace period.
    let max_age = (keys.settings().grace_period.as_secs() / 2).min(300);
    let mut response = Json(keys.jwks()).into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
    response
}

/// `GET /livez`
async fn livez() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// `GET /readyz`
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.engine.keys().is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "no active signing key"})),
        )
    }
}

// ── Admin ─────────────────────────────────────────────────────────────────

/// `POST /admin/keys/rotate`
async fn rotate_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = check_admin_auth(&state, &headers) {
        return response;
    }

    match state.engine.keys().rotate().await {
        Ok(key_id) => (StatusCode::OK, Json(json!({"pending_key_id": key_id}))).into_response(),
        Err(e) => key_error_response(&e),
    }
}

/// `POST /admin/keys/tick`
async fn tick_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = check_admin_auth(&state, &headers) {
        return response;
    }

    match state.engine.keys().tick().await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "promoted": outcome.promoted,
                "retired": outcome.retired,
                "purged": outcome.purged,
            })),
        )
            .into_response(),
        Err(e) => key_error_response(&e),
    }
}

/// `DELETE /admin/keys/{kid}`
async fn revoke_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kid): Path<String>,
) -> Response {
    if let Err(response) = check_admin_auth(&state, &headers) {
        return response;
    }

    match state.engine.keys().revoke(&kid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => key_error_response(&e),
    }
}

fn key_error_response(err: &KeyError) -> Response {
    match err {
        KeyError::KeyNotFound(_) => {
            error_response(StatusCode::NOT_FOUND, "key_not_found", "no such signing key")
        }
        other => {
            warn!(error = %other, "Key operation failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
                "the key operation could not be completed",
            )
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Check the `Authorization: Bearer <token>` header against the configured
/// admin token. Returns `Err(response)` if auth fails.
#[allow(clippy::result_large_err)]
fn check_admin_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    use subtle::ConstantTimeEq;

    let Some(ref admin_token) = state.admin_token else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin_not_configured",
            "admin token not configured, key administration disabled",
        ));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let matches =
        provided.is_some_and(|p| p.as_bytes().ct_eq(admin_token.as_bytes()).into());

    if matches {
        Ok(())
    } else {
        let mut response =
            error_response(StatusCode::UNAUTHORIZED, "unauthorized", "invalid admin token");
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        Err(response)
    }
}

/// Create an OAuth-style JSON error response.
fn error_response(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({"error": error, "error_description": description})),
    )
        .into_response()
}
