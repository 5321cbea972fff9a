//! Bearer-token authentication middleware.
//!
//! Applied to every endpoint except `/health`. The scheme string must be
//! exactly `Bearer` (case-sensitive). Tokens are hashed to fixed length
//! and compared in constant time so neither content nor length leaks.
//! Fail-closed: auth enabled with no token configured is a 500, never a
//! pass.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::ServerState;

fn deny(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

pub async fn require_auth(
    State(state): State<Arc<ServerState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if state.config.auth_disabled {
        return next.run(req).await;
    }

    // Auth enabled but no token configured: server misconfiguration.
    let Some(expected_hash) = &state.token_hash else {
        return deny(StatusCode::INTERNAL_SERVER_ERROR, "server misconfigured");
    };

    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(header) = header else {
        return deny(StatusCode::UNAUTHORIZED, "authorization required");
    };

    // strip_prefix is byte-exact, which enforces the case-sensitive
    // scheme.
    let Some(token) = header.strip_prefix("Bearer ") else {
        return deny(StatusCode::UNAUTHORIZED, "invalid authorization scheme");
    };
    if token.trim().is_empty() {
        return deny(StatusCode::UNAUTHORIZED, "invalid token");
    }

    let provided_hash = Sha256::digest(token.as_bytes());
    if !bool::from(provided_hash.ct_eq(&expected_hash[..])) {
        return deny(StatusCode::UNAUTHORIZED, "invalid token");
    }

    next.run(req).await
}
