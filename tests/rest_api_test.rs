//! REST surface tests: the router over an in-memory context, driven with
//! `tower::ServiceExt::oneshot` — no sockets.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use flockd::config::DaemonConfig;
use flockd::rest::build_router;
use flockd::storage::Storage;
use flockd::AppContext;

async fn test_ctx(config: DaemonConfig) -> (Arc<AppContext>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::in_memory().await.expect("in-memory storage");
    let ctx = AppContext::from_parts(config, storage, dir.path().to_path_buf());
    (ctx, dir)
}

fn req(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

fn runner_req(method: &str, uri: &str, runner: &str, body: Option<Value>) -> Request<Body> {
    let mut request = req(method, uri, body);
    request
        .headers_mut()
        .insert("x-runner-id", runner.parse().expect("header value"));
    request
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("router call");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

/// POST /profiles + POST /scenarios, returning (profile_id, scenario_id).
async fn seed_over_http(router: &Router) -> (String, String) {
    let (status, body) = call(
        router,
        req("POST", "/profiles", Some(json!({ "name": "test profile" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let profile_id = body["profile"]["id"].as_str().unwrap().to_string();

    let steps = json!([
        { "type": "navigate", "url": "https://example.com" },
        { "type": "wait", "duration_ms": 2000 },
        { "type": "screenshot" }
    ]);
    let (status, body) = call(
        router,
        req(
            "POST",
            "/scenarios",
            Some(json!({ "name": "visit example", "steps": steps })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let scenario_id = body["scenario"]["id"].as_str().unwrap().to_string();
    (profile_id, scenario_id)
}

// ── Health and misc ──────────────────────────────────────────────────────────

#[tokio::test]
async fn healthz_reports_ok() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);

    let (status, body) = call(&router, req("GET", "/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
    assert_eq!(body["queue_depth"], 0);
}

#[tokio::test]
async fn unknown_resources_return_404_with_error_body() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);

    for uri in ["/sessions/nope", "/tasks/nope", "/scenarios/nope", "/profiles/nope"] {
        let (status, body) = call(&router, req("GET", uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].is_string(), "{uri} must carry an error field");
    }
}

// ── Runner work loop ─────────────────────────────────────────────────────────

#[tokio::test]
async fn poll_without_runner_header_is_rejected() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);

    let (status, body) = call(&router, req("GET", "/jobs", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("x-runner-id"));
}

#[tokio::test]
async fn runner_loop_claim_report_complete() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);
    let (profile_id, scenario_id) = seed_over_http(&router).await;

    // Fan out one ad-hoc session.
    let (status, body) = call(
        &router,
        req(
            "POST",
            "/sessions",
            Some(json!({ "scenario_id": scenario_id, "profile_ids": [profile_id] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["created"], 1);
    let session_id = body["sessions"][0]["id"].as_str().unwrap().to_string();

    // Claim it.
    let (status, job) = call(&router, runner_req("GET", "/jobs", "runner-a", None)).await;
    assert_eq!(status, StatusCode::OK, "{job}");
    assert_eq!(job["session"]["id"], session_id.as_str());
    assert_eq!(job["session"]["status"], "running");
    assert_eq!(job["scenario"]["step_count"], 3);
    assert!(job["delay_before_start_ms"].is_u64());

    // Nothing left to claim.
    let (status, _) = call(&router, runner_req("GET", "/jobs", "runner-b", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Progress report, then some logs.
    let (status, body) = call(
        &router,
        req(
            "PATCH",
            &format!("/sessions/{session_id}"),
            Some(json!({ "progress": 66, "current_step": 2, "is_resumable": true, "last_successful_step": 1 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["session"]["progress"], 66);

    let (status, body) = call(
        &router,
        req(
            "POST",
            "/logs",
            Some(json!([
                { "session_id": session_id, "level": "info", "message": "navigated", "step_index": 0 },
                { "session_id": session_id, "level": "info", "message": "waited", "step_index": 1 }
            ])),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["written"], 2);

    // Terminal report.
    let (status, body) = call(
        &router,
        req(
            "PATCH",
            &format!("/sessions/{session_id}"),
            Some(json!({ "status": "success", "progress": 100 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["session"]["status"], "success");

    let (status, body) = call(
        &router,
        req("GET", &format!("/sessions/{session_id}/logs"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logs"].as_array().unwrap().len(), 2);

    // Lease is gone.
    let (status, body) = call(&router, req("GET", "/queue", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["depth"], 0);
}

#[tokio::test]
async fn capacity_refusal_is_429_with_counts() {
    let mut config = DaemonConfig::default();
    config.scheduler.max_concurrency = 1;
    let (ctx, _dir) = test_ctx(config).await;
    let router = build_router(ctx);
    let (profile_id, scenario_id) = seed_over_http(&router).await;

    let (status, _) = call(
        &router,
        req(
            "POST",
            "/sessions",
            Some(json!({
                "scenario_id": scenario_id,
                "profile_ids": [profile_id.clone(), profile_id]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(&router, runner_req("GET", "/jobs", "runner-a", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, runner_req("GET", "/jobs", "runner-a", None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["running"], 1);
    assert_eq!(body["max_concurrency"], 1);
}

#[tokio::test]
async fn reporting_against_a_terminal_session_is_a_conflict() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);
    let (profile_id, scenario_id) = seed_over_http(&router).await;

    let (status, body) = call(
        &router,
        req(
            "POST",
            "/sessions",
            Some(json!({ "scenario_id": scenario_id, "profile_ids": [profile_id] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = body["sessions"][0]["id"].as_str().unwrap().to_string();

    let (status, _) = call(&router, runner_req("GET", "/jobs", "runner-a", None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &router,
        req(
            "PATCH",
            &format!("/sessions/{session_id}"),
            Some(json!({ "status": "success" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // A second terminal report is refused, not treated as a server fault.
    let (status, body) = call(
        &router,
        req(
            "PATCH",
            &format!("/sessions/{session_id}"),
            Some(json!({ "status": "success" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert!(body["error"].as_str().unwrap().contains("success"));
}

#[tokio::test]
async fn store_failures_surface_as_internal_errors() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx.clone());
    let (profile_id, scenario_id) = seed_over_http(&router).await;

    let (status, body) = call(
        &router,
        req(
            "POST",
            "/sessions",
            Some(json!({ "scenario_id": scenario_id, "profile_ids": [profile_id] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = body["sessions"][0]["id"].as_str().unwrap().to_string();
    let (status, _) = call(&router, runner_req("GET", "/jobs", "runner-a", None)).await;
    assert_eq!(status, StatusCode::OK);

    // Pull the database out from under the handler: the report must come
    // back as a 500, never a 409.
    ctx.storage.pool().close().await;
    let (status, body) = call(
        &router,
        req(
            "PATCH",
            &format!("/sessions/{session_id}"),
            Some(json!({ "status": "success" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{body}");
    assert_eq!(body["error"], "internal error");
}

#[tokio::test]
async fn heartbeats_drive_the_fleet_view() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);

    let (status, body) = call(
        &router,
        runner_req(
            "POST",
            "/health",
            "runner-a",
            Some(json!({ "active_sessions": 2, "total_executed": 10, "uptime_seconds": 300 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = call(&router, req("GET", "/runners", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fleet"], "online");
    let runners = body["runners"].as_array().unwrap();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0]["id"], "runner-a");
    assert_eq!(runners[0]["online"], true);
    assert_eq!(runners[0]["active_sessions"], 2);
}

// ── Scenario validation ──────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_scenario_steps_are_rejected() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);

    let (status, body) = call(
        &router,
        req(
            "POST",
            "/scenarios",
            Some(json!({
                "name": "broken",
                "steps": [{ "type": "click" }]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("step"), "{body}");
}

#[tokio::test]
async fn stored_scenarios_can_be_revalidated() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);
    let (_, scenario_id) = seed_over_http(&router).await;

    let (status, body) = call(
        &router,
        req("POST", &format!("/scenarios/{scenario_id}/validate"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert!(body["estimated_duration_seconds"].as_i64().unwrap() > 0);
}

// ── Task lifecycle over HTTP ─────────────────────────────────────────────────

#[tokio::test]
async fn task_lifecycle_over_http() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx);
    let (profile_id, _) = seed_over_http(&router).await;

    let (status, body) = call(
        &router,
        req(
            "POST",
            "/tasks",
            Some(json!({
                "goal": "browse example.com like a returning visitor",
                "entry_url": "https://example.com",
                "profile_ids": [profile_id],
                "run_count": 2
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["task"]["status"], "draft");
    let task_id = body["task"]["id"].as_str().unwrap().to_string();

    // Starting before a scenario exists is refused.
    let (status, _) = call(&router, req("POST", &format!("/tasks/{task_id}/start"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Compile (template fallback — no external compiler configured).
    let (status, body) = call(
        &router,
        req("POST", &format!("/tasks/{task_id}/generate-scenario"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["scenario"]["generated"], true);
    assert_eq!(body["scenario"]["valid"], true);

    let (status, body) = call(&router, req("POST", &format!("/tasks/{task_id}/start"), None)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["created"], 2);

    let (status, body) = call(&router, req("GET", &format!("/tasks/{task_id}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["status"], "active");
    assert_eq!(body["sessions"].as_array().unwrap().len(), 2);

    // Pause drains the queue; resume refills it; re-pausing a cancelled task
    // conflicts.
    let (status, _) = call(&router, req("POST", &format!("/tasks/{task_id}/pause"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&router, req("GET", "/queue", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["depth"], 0);

    let (status, _) = call(&router, req("POST", &format!("/tasks/{task_id}/resume"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&router, req("GET", "/queue", None)).await;
    assert_eq!(body["depth"], 2);

    let (status, _) = call(&router, req("POST", &format!("/tasks/{task_id}/stop"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&router, req("POST", &format!("/tasks/{task_id}/pause"), None)).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
}

// ── Live config ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_config_can_be_read_and_replaced() {
    let (ctx, _dir) = test_ctx(DaemonConfig::default()).await;
    let router = build_router(ctx.clone());

    let (status, body) = call(&router, req("GET", "/config", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduler"]["max_concurrency"], 3);

    // Inverted delay bounds are refused.
    let mut bad = DaemonConfig::default().scheduler;
    bad.min_delay_ms = 10_000;
    bad.max_delay_ms = 1_000;
    let (status, _) = call(
        &router,
        req("PUT", "/config/scheduler", Some(serde_json::to_value(&bad).unwrap())),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A valid replacement takes effect immediately.
    let mut updated = DaemonConfig::default().scheduler;
    updated.max_concurrency = 7;
    updated.active = false;
    let (status, body) = call(
        &router,
        req(
            "PUT",
            "/config/scheduler",
            Some(serde_json::to_value(&updated).unwrap()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (_, body) = call(&router, req("GET", "/config", None)).await;
    assert_eq!(body["scheduler"]["max_concurrency"], 7);
    assert_eq!(body["scheduler"]["active"], false);
    assert_eq!(*ctx.scheduler_config.read().await, updated);
}
