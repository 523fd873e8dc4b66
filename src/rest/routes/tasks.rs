// rest/routes/tasks.rs — Task lifecycle routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::{ApiError, ApiResult};
use crate::tasks::NewTask;
use crate::AppContext;

pub async fn create_task(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let task = ctx
        .orchestrator
        .create(&body)
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(json!({ "task": task }))))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = ctx.orchestrator.tasks().list(query.status.as_deref()).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = ctx
        .orchestrator
        .tasks()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id}")))?;
    let sessions = ctx.sessions.list_for_task(&id).await?;
    Ok(Json(json!({ "task": task, "sessions": sessions })))
}

/// POST /tasks/{id}/generate-scenario — compile a scenario from the task's
/// goal and behavior config via the collaborator (template fallback when the
/// external compiler is unavailable).
pub async fn generate_scenario(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.orchestrator.tasks().get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("task {id}")));
    }
    let scenario = ctx
        .orchestrator
        .generate_scenario(&id, ctx.compiler.as_ref())
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(Json(json!({ "scenario": scenario })))
}

/// POST /tasks/{id}/start — fan out `profiles × run_count` sessions, enqueue
/// them all at priority 0, and activate the task.
pub async fn start_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = ctx
        .orchestrator
        .tasks()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id}")))?;
    if task.scenario_id.is_none() {
        return Err(ApiError::Validation(format!(
            "task {id} has no generated scenario"
        )));
    }
    if task.profile_id_list().is_empty() {
        return Err(ApiError::Validation(format!("task {id} has no profiles")));
    }
    let fan_out = ctx
        .orchestrator
        .start(&id)
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(Json(json!({
        "created": fan_out.created,
        "sessions": fan_out.sessions,
    })))
}

pub async fn pause_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.orchestrator.tasks().get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("task {id}")));
    }
    let task = ctx
        .orchestrator
        .pause(&id)
        .await
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(json!({ "success": true, "task": task })))
}

pub async fn resume_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.orchestrator.tasks().get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("task {id}")));
    }
    let task = ctx
        .orchestrator
        .resume(&id)
        .await
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(json!({ "success": true, "task": task })))
}

pub async fn stop_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.orchestrator.tasks().get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("task {id}")));
    }
    let task = ctx
        .orchestrator
        .stop(&id)
        .await
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(json!({ "success": true, "task": task })))
}
