//! HTTP surface of the multi-session execution service.
//!
//! | Method | Path              | Auth   |
//! |--------|-------------------|--------|
//! | POST   | `/execute`        | Bearer |
//! | GET    | `/health`         | none   |
//! | GET    | `/info`           | Bearer |
//! | POST   | `/reset`          | Bearer |
//! | POST   | `/install_deps`   | Bearer |
//! | POST   | `/uninstall_deps` | Bearer |
//!
//! `GET /sessions` is deliberately absent: enumerating sessions is an
//! information-disclosure vector.

use std::sync::Arc;

use cm_exec::Executor;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::require_auth;
use crate::state::ServerState;

const SESSION_HEADER: &str = "x-session-id";

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/info", get(info))
        .route("/reset", post(reset))
        .route("/install_deps", post(install_deps))
        .route("/uninstall_deps", post(uninstall_deps))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .route("/health", get(health))
        .with_state(state)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /execute
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct ExecuteRequest {
    code: String,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Serialize)]
struct ExecuteResponse {
    value: serde_json::Value,
    stdout: String,
    error: Option<String>,
    execution_time_ms: f64,
    session_id: String,
}

async fn execute(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    state.cleanup_expired_sessions().await;

    let (session_id, executor) = state.session_executor(session_header(&headers)).await;
    let timeout = body.timeout.or(Some(state.config.default_timeout_sec));

    let start = std::time::Instant::now();
    let result = match executor.run(&body.code, timeout).await {
        Ok(result) => result,
        Err(e) => {
            return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    Json(ExecuteResponse {
        value: result.value.unwrap_or(serde_json::Value::Null),
        stdout: result.stdout,
        error: result.error,
        execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        session_id,
    })
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: f64,
}

/// Unauthenticated so orchestrators can probe liveness. Exposes no
/// session count.
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct InfoEntry {
    name: String,
    description: String,
}

#[derive(Serialize)]
struct InfoResponse {
    tools: Vec<InfoEntry>,
    skills: Vec<InfoEntry>,
    artifacts_path: String,
}

async fn info(State(state): State<Arc<ServerState>>) -> Response {
    let tools = state
        .resources
        .registry
        .list_tools(None)
        .into_iter()
        .map(|t| InfoEntry {
            name: t.name,
            description: t.description,
        })
        .collect();

    let skills = match state.resources.skills.list().await {
        Ok(skills) => skills
            .into_iter()
            .map(|s| InfoEntry {
                name: s.name,
                description: s.description,
            })
            .collect(),
        Err(e) => return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    Json(InfoResponse {
        tools,
        skills,
        artifacts_path: state.resources.artifacts.display_path(),
    })
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /reset
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct ResetResponse {
    status: String,
    session_id: String,
}

async fn reset(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Json<ResetResponse> {
    let session_id = session_header(&headers).unwrap_or_default().to_string();
    if !session_id.is_empty() {
        state.remove_session(&session_id).await;
    }
    Json(ResetResponse {
        status: "reset".to_string(),
        session_id,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /install_deps, POST /uninstall_deps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct DepsRequest {
    packages: Vec<String>,
}

/// System-level install used by the container executor during session
/// sync. Not gated by the runtime-deps flag; agent-initiated installs
/// are blocked at the namespace layer.
async fn install_deps(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<DepsRequest>,
) -> Response {
    match state.resources.deps.install(&body.packages).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn uninstall_deps(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<DepsRequest>,
) -> Response {
    match state.resources.deps.uninstall(&body.packages).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
