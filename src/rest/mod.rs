// rest/mod.rs — Public REST API server.
//
// Axum HTTP server runners and operators talk to. Runner identity travels in
// the x-runner-id header on every call; there is no separate auth layer at
// this level.
//
// Endpoints:
//   GET    /jobs                              (claim; 204 no work, 429 capacity)
//   POST   /sessions          GET /sessions{,/{id}}
//   PATCH  /sessions/{id}     {,/captcha,/url,/profile-state}
//   POST   /sessions/{id}/{retry,pause,resume,cancel}
//   GET    /sessions/{id}/logs   POST /logs
//   POST   /health            GET /runners      GET /healthz
//   POST   /tasks             GET /tasks{,/{id}}
//   POST   /tasks/{id}/{generate-scenario,start,pause,resume,stop}
//   POST   /scenarios         GET /scenarios/{id}   POST /scenarios/{id}/validate
//   POST   /profiles          GET /profiles
//   GET    /config            PUT /config/scheduler
//   GET    /queue

pub mod error;
pub mod routes;

use anyhow::Result;
use axum::{
    routing::{get, patch, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

/// Request header carrying the runner identity.
pub const RUNNER_ID_HEADER: &str = "x-runner-id";

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Daemon self-health
        .route("/healthz", get(routes::health::healthz))
        // Runner work loop
        .route("/jobs", get(routes::jobs::poll))
        .route("/health", post(routes::runners::heartbeat))
        .route("/runners", get(routes::runners::list_runners))
        // Sessions
        .route(
            "/sessions",
            get(routes::sessions::list_sessions).post(routes::sessions::create_sessions),
        )
        .route(
            "/sessions/{id}",
            get(routes::sessions::get_session).patch(routes::sessions::report_session),
        )
        .route("/sessions/{id}/captcha", patch(routes::sessions::update_captcha))
        .route("/sessions/{id}/url", patch(routes::sessions::update_url))
        .route(
            "/sessions/{id}/profile-state",
            patch(routes::sessions::update_profile_state),
        )
        .route("/sessions/{id}/retry", post(routes::sessions::retry_session))
        .route("/sessions/{id}/pause", post(routes::sessions::pause_session))
        .route("/sessions/{id}/resume", post(routes::sessions::resume_session))
        .route("/sessions/{id}/cancel", post(routes::sessions::cancel_session))
        .route("/sessions/{id}/logs", get(routes::logs::session_logs))
        .route("/logs", post(routes::logs::append_logs))
        // Tasks
        .route(
            "/tasks",
            get(routes::tasks::list_tasks).post(routes::tasks::create_task),
        )
        .route("/tasks/{id}", get(routes::tasks::get_task))
        .route(
            "/tasks/{id}/generate-scenario",
            post(routes::tasks::generate_scenario),
        )
        .route("/tasks/{id}/start", post(routes::tasks::start_task))
        .route("/tasks/{id}/pause", post(routes::tasks::pause_task))
        .route("/tasks/{id}/resume", post(routes::tasks::resume_task))
        .route("/tasks/{id}/stop", post(routes::tasks::stop_task))
        // Scenarios
        .route("/scenarios", post(routes::scenarios::create_scenario))
        .route("/scenarios/{id}", get(routes::scenarios::get_scenario))
        .route(
            "/scenarios/{id}/validate",
            post(routes::scenarios::validate_scenario),
        )
        // Profiles
        .route(
            "/profiles",
            get(routes::profiles::list_profiles).post(routes::profiles::create_profile),
        )
        .route("/profiles/{id}", get(routes::profiles::get_profile))
        // Config
        .route("/config", get(routes::config::get_config))
        .route("/config/scheduler", put(routes::config::update_scheduler))
        // Queue overview
        .route("/queue", get(routes::jobs::queue_overview))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Extract the runner identity header, or reject the request.
pub fn runner_id(headers: &axum::http::HeaderMap) -> Result<String, error::ApiError> {
    headers
        .get(RUNNER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            error::ApiError::Validation(format!("missing {RUNNER_ID_HEADER} header"))
        })
}
