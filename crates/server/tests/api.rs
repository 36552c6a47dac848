//! API surface tests driven through the router with in-memory state.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use std::sync::Arc;
use testforge_common::Database;
use testforge_engine::{
    AccessControl, CompositionStore, Dispatcher, DispatcherConfig, ExecutionMachine,
    ExecutorRegistry,
};
use testforge_server::auth::UserStore;
use testforge_server::routes::{self, AppState};
use tower::ServiceExt;

const ADMIN_PASS: &str = "admin-pass-123";

fn app() -> (Router, AppState) {
    let db = Database::open_memory().unwrap();
    let store = CompositionStore::new(db.clone());
    let machine = ExecutionMachine::new(db.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        machine,
        ExecutorRegistry::with_builtins(),
        DispatcherConfig::default(),
    );
    let users = UserStore::new(db);
    users.seed_bootstrap_admin(Some(ADMIN_PASS)).unwrap();

    let state = AppState {
        store,
        dispatcher,
        access: Arc::new(AccessControl::new()),
        users,
    };
    (routes::router(state.clone()), state)
}

fn basic(user: &str, pass: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
    )
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    auth: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn healthz_is_public() {
    let (app, _) = app();
    let (status, body) = send(&app, "GET", "/api/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_credentials_rejected() {
    let (app, _) = app();
    let (status, _) = send(&app, "GET", "/api/tenants", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        "GET",
        "/api/tenants",
        Some(&basic("admin", "wrong")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tenant_crud_is_admin_only() {
    let (app, _) = app();
    let admin = basic("admin", ADMIN_PASS);

    let (status, tenant) = send(
        &app,
        "POST",
        "/api/tenants",
        Some(&admin),
        Some(serde_json::json!({"name": "Acme", "schema_name": "acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let tenant_id = tenant["id"].as_str().unwrap().to_string();

    // Duplicate schema name conflicts
    let (status, _) = send(
        &app,
        "POST",
        "/api/tenants",
        Some(&admin),
        Some(serde_json::json!({"name": "Other", "schema_name": "acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // A tenant-scoped manager cannot create tenants
    let (status, _) = send(
        &app,
        "POST",
        "/api/users",
        Some(&admin),
        Some(serde_json::json!({
            "username": "mgr", "password": "mgr-pass-123",
            "role": "test_manager", "tenant_id": tenant_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(
        &app,
        "POST",
        "/api/tenants",
        Some(&basic("mgr", "mgr-pass-123")),
        Some(serde_json::json!({"name": "Rogue", "schema_name": "rogue"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn authoring_and_submission_flow() {
    let (app, _) = app();
    let admin = basic("admin", ADMIN_PASS);

    let (_, tenant) = send(
        &app,
        "POST",
        "/api/tenants",
        Some(&admin),
        Some(serde_json::json!({"name": "Acme", "schema_name": "acme"})),
    )
    .await;
    let tenant_id = tenant["id"].as_str().unwrap().to_string();
    send(
        &app,
        "POST",
        "/api/users",
        Some(&admin),
        Some(serde_json::json!({
            "username": "mgr", "password": "mgr-pass-123",
            "role": "test_manager", "tenant_id": tenant_id,
        })),
    )
    .await;
    let mgr = basic("mgr", "mgr-pass-123");

    let (status, project) = send(
        &app,
        "POST",
        &format!("/api/tenants/{tenant_id}/projects"),
        Some(&mgr),
        Some(serde_json::json!({"name": "Web"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["id"].as_str().unwrap();

    let (status, suite) = send(
        &app,
        "POST",
        &format!("/api/projects/{project_id}/suites"),
        Some(&mgr),
        Some(serde_json::json!({"name": "Smoke"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let suite_id = suite["id"].as_str().unwrap();

    // Predefined definitions are visible
    let (status, defs) = send(&app, "GET", "/api/step-definitions", Some(&mgr), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(defs
        .as_array()
        .unwrap()
        .iter()
        .any(|d| d["id"] == "builtin:navigate"));

    // Missing required parameter fails with the step index
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/suites/{suite_id}/tests"),
        Some(&mgr),
        Some(serde_json::json!({
            "name": "broken",
            "steps": [
                {"step_definition_id": "builtin:navigate", "parameters": {"url": "http://x"}},
                {"step_definition_id": "builtin:click", "parameters": {}},
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["step_index"], 1);

    let (status, case) = send(
        &app,
        "POST",
        &format!("/api/suites/{suite_id}/tests"),
        Some(&mgr),
        Some(serde_json::json!({
            "name": "open home",
            "steps": [
                {"step_definition_id": "builtin:navigate", "parameters": {"url": "http://x"}},
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let case_id = case["id"].as_str().unwrap();

    // Submission is async: accepted with pre-created pending steps
    let (status, execution) = send(
        &app,
        "POST",
        &format!("/api/tests/{case_id}/executions"),
        Some(&mgr),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(execution["status"], "accepted");
    assert_eq!(execution["steps"].as_array().unwrap().len(), 1);
    assert_eq!(execution["steps"][0]["status"], "pending");

    let execution_id = execution["id"].as_str().unwrap();
    let (status, polled) = send(
        &app,
        "GET",
        &format!("/api/executions/{execution_id}"),
        Some(&mgr),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polled["test_case_id"], case_id);

    // Cancel while unclaimed fails it immediately
    let (status, cancelled) = send(
        &app,
        "POST",
        &format!("/api/executions/{execution_id}/cancel"),
        Some(&mgr),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "failed");
    assert_eq!(cancelled["error"], "cancelled");
}

#[tokio::test]
async fn api_key_authentication() {
    let (app, _) = app();
    let admin = basic("admin", ADMIN_PASS);

    let (status, body) = send(&app, "POST", "/api/api-keys", Some(&admin), None).await;
    assert_eq!(status, StatusCode::CREATED);
    let key = body["api_key"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("GET")
        .uri("/api/tenants")
        .header("x-api-key", &key)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/api/tenants")
        .header("x-api-key", "tfk_bogus")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cross_tenant_access_denied() {
    let (app, _) = app();
    let admin = basic("admin", ADMIN_PASS);

    let (_, a) = send(
        &app,
        "POST",
        "/api/tenants",
        Some(&admin),
        Some(serde_json::json!({"name": "A", "schema_name": "tenant_a"})),
    )
    .await;
    let (_, b) = send(
        &app,
        "POST",
        "/api/tenants",
        Some(&admin),
        Some(serde_json::json!({"name": "B", "schema_name": "tenant_b"})),
    )
    .await;

    send(
        &app,
        "POST",
        "/api/users",
        Some(&admin),
        Some(serde_json::json!({
            "username": "b_mgr", "password": "b-pass-1234",
            "role": "test_manager", "tenant_id": b["id"],
        })),
    )
    .await;

    let a_id = a["id"].as_str().unwrap();
    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/tenants/{a_id}/projects"),
        Some(&basic("b_mgr", "b-pass-1234")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
