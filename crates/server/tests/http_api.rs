//! HTTP contract tests: the auth matrix, session persistence through
//! `X-Session-ID`, and the deps endpoints' flag-injection guard.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use cm_domain::config::ServerConfig;
use cm_server::{router, ServerState};

async fn test_state(dir: &std::path::Path, token: Option<&str>, disabled: bool) -> Arc<ServerState> {
    let config = ServerConfig {
        auth_token: token.map(str::to_string),
        auth_disabled: disabled,
        skills_path: dir.join("skills"),
        artifacts_path: dir.join("artifacts"),
        deps_path: Some(dir.join("deps")),
        tools_path: None,
        ..Default::default()
    };
    ServerState::initialize(config).await.unwrap()
}

fn execute_request(auth: Option<&str>, session: Option<&str>, code: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    if let Some(session) = session {
        builder = builder.header("x-session-id", session);
    }
    builder
        .body(Body::from(
            serde_json::json!({ "code": code }).to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Some("t"), false).await;

    // Missing header.
    let resp = router(state.clone())
        .oneshot(execute_request(None, None, "1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Wrong token.
    let resp = router(state.clone())
        .oneshot(execute_request(Some("Bearer wrong"), None, "1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Lowercased scheme is rejected: the scheme is case-sensitive.
    let resp = router(state.clone())
        .oneshot(execute_request(Some("bearer t"), None, "1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Blank token.
    let resp = router(state.clone())
        .oneshot(execute_request(Some("Bearer  "), None, "1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Correct token.
    let resp = router(state.clone())
        .oneshot(execute_request(Some("Bearer t"), None, "1 + 1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["value"], serde_json::json!(2));

    // Health stays open.
    let resp = router(state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "healthy");
    assert!(body.get("active_sessions").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn misconfigured_auth_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), None, false).await;

    let resp = router(state)
        .oneshot(execute_request(Some("Bearer anything"), None, "1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_auth_allows_everything() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), None, true).await;

    let resp = router(state)
        .oneshot(execute_request(None, None, "2 + 2"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["value"], serde_json::json!(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_persist_state_and_reset_drops_them() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Some("t"), false).await;

    // First call without a session id: the server mints one.
    let resp = router(state.clone())
        .oneshot(execute_request(Some("Bearer t"), None, "let x = 42;"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    // Same session sees the binding.
    let resp = router(state.clone())
        .oneshot(execute_request(
            Some("Bearer t"),
            Some(&session_id),
            "x * 2",
        ))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["value"], serde_json::json!(84));

    // A different session does not.
    let resp = router(state.clone())
        .oneshot(execute_request(Some("Bearer t"), Some("other"), "x"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("x"));

    // Reset drops the session; the binding is gone afterwards.
    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/reset")
                .header("authorization", "Bearer t")
                .header("x-session-id", &session_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "reset");

    let resp = router(state)
        .oneshot(execute_request(
            Some("Bearer t"),
            Some(&session_id),
            "x",
        ))
        .await
        .unwrap();
    assert!(body_json(resp).await["error"].as_str().unwrap().contains("x"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deps_endpoints_guard_flag_injection() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Some("t"), false).await;

    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/install_deps")
                .header("authorization", "Bearer t")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"packages": ["good-pkg", "-rf"]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["installed"], serde_json::json!(["good-pkg"]));
    assert_eq!(body["failed"], serde_json::json!(["-rf"]));

    let resp = router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/uninstall_deps")
                .header("authorization", "Bearer t")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"packages": ["good-pkg", "ghost"]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["removed"], serde_json::json!(["good-pkg"]));
    assert_eq!(body["not_found"], serde_json::json!(["ghost"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn info_lists_tools_and_skills() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("skills")).unwrap();
    std::fs::write(
        dir.path().join("skills/triple.rhai"),
        "//! Triple a number\nfn run(n) { n * 3 }\n",
    )
    .unwrap();
    let state = test_state(dir.path(), Some("t"), false).await;

    let resp = router(state)
        .oneshot(
            Request::builder()
                .uri("/info")
                .header("authorization", "Bearer t")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["skills"][0]["name"], "triple");
    assert!(body["artifacts_path"].as_str().unwrap().contains("artifacts"));
}
