// rest/routes/runners.rs — Runner heartbeat and fleet listing.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::ApiResult;
use crate::rest::runner_id;
use crate::runners::Heartbeat;
use crate::AppContext;

/// POST /health — runner heartbeat. Upserts the record; liveness is derived
/// at read time, never stored.
pub async fn heartbeat(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<Heartbeat>,
) -> ApiResult<Json<Value>> {
    let runner = runner_id(&headers)?;
    ctx.runners.heartbeat(&runner, &body).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /runners — all health records plus the derived fleet status.
pub async fn list_runners(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Value>> {
    let window = ctx.config.health.freshness_window_secs;
    let runners = ctx.runners.list(window).await?;
    let fleet = ctx.runners.fleet_status(window).await?;
    Ok(Json(json!({ "fleet": fleet, "runners": runners })))
}
