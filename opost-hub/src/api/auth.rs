//! Authentication middleware
//!
//! Mutating endpoints carry `timestamp` and `hash` fields inside their JSON
//! body; the hash is SHA-256 over the canonical body plus the shared secret.
//! Secret 0 disables all checking, which local setups and the test suites
//! rely on.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use opost_common::auth::{validate_hash, validate_timestamp};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::AppState;

/// 1MB cap; every legitimate request body is far smaller
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct AuthFields {
    timestamp: i64,
    hash: String,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if state.shared_secret == 0 {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AuthError::ParseError(format!("failed to read body: {}", e)))?;

    let json_value: Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| AuthError::ParseError(format!("invalid JSON: {}", e)))?;

    let auth_fields: AuthFields = serde_json::from_value(json_value.clone())
        .map_err(|e| AuthError::MissingFields(format!("missing auth fields: {}", e)))?;

    validate_timestamp(auth_fields.timestamp)
        .map_err(|e| AuthError::InvalidTimestamp(e.to_string()))?;

    validate_hash(&auth_fields.hash, &json_value, state.shared_secret).map_err(|_| {
        warn!(path = %parts.uri.path(), "request hash validation failed");
        AuthError::InvalidHash
    })?;

    // Restore the consumed body for the handler
    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}

#[derive(Debug)]
pub enum AuthError {
    InvalidTimestamp(String),
    InvalidHash,
    MissingFields(String),
    ParseError(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::InvalidTimestamp(reason) => {
                (StatusCode::UNAUTHORIZED, format!("invalid timestamp: {}", reason))
            }
            AuthError::InvalidHash => (StatusCode::UNAUTHORIZED, "invalid hash".to_string()),
            AuthError::MissingFields(msg) => (StatusCode::BAD_REQUEST, msg),
            AuthError::ParseError(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({
            "error": message,
        }));
        (status, body).into_response()
    }
}
