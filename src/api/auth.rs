//! API-key authentication.
//!
//! - Every route except `/api/health` expects an `X-API-Key` header
//! - With `DEV_MODE=true` and no `API_KEY`, checks are skipped entirely

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::routes::AppState;
use crate::config::AuthMode;

pub const API_KEY_HEADER: &str = "x-api-key";

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    a_bytes
        .iter()
        .zip(b_bytes)
        .fold(0u8, |diff, (x, y)| diff | (x ^ y))
        == 0
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if state.config.auth_mode() == AuthMode::Disabled {
        return next.run(req).await;
    }

    // Fail closed when no key is configured
    let Some(expected) = state.config.api_key.as_deref() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "API_KEY not configured").into_response();
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .trim();

    if provided.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing X-API-Key header").into_response();
    }
    if !constant_time_eq(provided, expected) {
        tracing::warn!(path = %req.uri().path(), "Rejected request with invalid API key");
        return (StatusCode::UNAUTHORIZED, "Invalid API key").into_response();
    }

    next.run(req).await
}
