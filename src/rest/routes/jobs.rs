// rest/routes/jobs.rs — Runner work-claim routes.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::{ApiError, ApiResult};
use crate::rest::runner_id;
use crate::scheduler::ClaimOutcome;
use crate::AppContext;

/// GET /jobs — one poll cycle. 200 with the joined payload, 204 when there is
/// no claimable work, 429 when the runner is at its concurrency ceiling.
pub async fn poll(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> ApiResult<Response> {
    let runner = runner_id(&headers)?;
    match ctx.scheduler.claim(&runner).await? {
        ClaimOutcome::Job(payload) => Ok((
            StatusCode::OK,
            Json(json!({
                "job_id": payload.job_id,
                "session": payload.session,
                "scenario": payload.scenario,
                "profile": payload.profile,
                "delay_before_start_ms": payload.delay_before_start_ms,
            })),
        )
            .into_response()),
        ClaimOutcome::NoWork => Ok(StatusCode::NO_CONTENT.into_response()),
        ClaimOutcome::Capacity { running, max } => {
            Err(ApiError::CapacityExceeded { running, max })
        }
    }
}

/// GET /queue — pending depth and entries in claim order.
pub async fn queue_overview(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Value>> {
    let entries = ctx.queue.list().await?;
    let depth = ctx.queue.depth().await?;
    Ok(Json(json!({ "depth": depth, "entries": entries })))
}
