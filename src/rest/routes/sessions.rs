// rest/routes/sessions.rs — Session REST routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::{ApiError, ApiResult};
use crate::AppContext;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let sessions = ctx
        .sessions
        .list(query.status.as_deref(), query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match ctx.sessions.get(&id).await? {
        Some(session) => Ok(Json(json!({ "session": session }))),
        None => Err(ApiError::not_found(format!("session {id}"))),
    }
}

#[derive(Deserialize)]
pub struct CreateSessionsRequest {
    pub scenario_id: String,
    #[serde(default)]
    pub profile_ids: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

/// POST /sessions — fan one scenario out across profiles, outside any task.
pub async fn create_sessions(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSessionsRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let scenario = ctx
        .storage
        .get_scenario(&body.scenario_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("scenario {}", body.scenario_id)))?;
    if body.profile_ids.is_empty() {
        return Err(ApiError::Validation("no profiles given".into()));
    }
    for profile_id in &body.profile_ids {
        if ctx.storage.get_profile(profile_id).await?.is_none() {
            return Err(ApiError::Validation(format!("profile {profile_id} not found")));
        }
    }

    let mut sessions = Vec::new();
    for profile_id in &body.profile_ids {
        let session = ctx
            .sessions
            .create(profile_id, &scenario.id, None, scenario.step_count)
            .await?;
        ctx.queue.enqueue(&session.id, body.priority).await?;
        sessions.push(session);
    }
    Ok((
        StatusCode::CREATED,
        Json(json!({ "created": sessions.len(), "sessions": sessions })),
    ))
}

#[derive(Deserialize)]
pub struct SessionReport {
    /// Terminal outcome of the attempt: "success" or "error".
    pub status: Option<String>,
    pub error: Option<String>,
    pub progress: Option<i64>,
    pub current_step: Option<i64>,
    pub is_resumable: Option<bool>,
    pub last_successful_step: Option<i64>,
    pub screenshot: Option<String>,
    pub metadata: Option<Value>,
}

/// PATCH /sessions/{id} — runner status/progress report.
pub async fn report_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(report): Json<SessionReport>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }

    if report.is_resumable.is_some() || report.last_successful_step.is_some() {
        let session = ctx.sessions.get_required(&id).await?;
        ctx.sessions
            .set_resumable(
                &id,
                report.is_resumable.unwrap_or(session.is_resumable),
                report.last_successful_step.or(session.last_successful_step),
            )
            .await?;
    }
    if let Some(screenshot) = &report.screenshot {
        ctx.sessions.update_screenshot(&id, screenshot).await?;
    }
    if let Some(metadata) = &report.metadata {
        ctx.sessions.merge_metadata(&id, metadata).await?;
    }
    if report.progress.is_some() || report.current_step.is_some() {
        let progress = report.progress.unwrap_or(0);
        let current_step = report.current_step.unwrap_or(0);
        ctx.sessions
            .update_progress(&id, progress, current_step)
            .await
            .map_err(|e| ApiError::Validation(e.to_string()))?;
    }

    match report.status.as_deref() {
        None => {}
        Some("success") => {
            ctx.scheduler
                .complete_session(&id)
                .await
                .map_err(ApiError::from_transition)?;
        }
        Some("error") => {
            let error = report.error.as_deref().unwrap_or("unspecified runner error");
            ctx.scheduler
                .fail_session(&id, error)
                .await
                .map_err(ApiError::from_transition)?;
        }
        Some(other) => {
            return Err(ApiError::Validation(format!(
                "report status must be success or error, got {other:?}"
            )));
        }
    }

    let session = ctx.sessions.get_required(&id).await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Deserialize)]
pub struct CaptchaUpdate {
    pub captcha_status: String,
}

/// PATCH /sessions/{id}/captcha — captcha sub-state, independent of the
/// primary status.
pub async fn update_captcha(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<CaptchaUpdate>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    let session = ctx
        .sessions
        .update_captcha(&id, &body.captcha_status)
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(Json(json!({ "success": true, "session": session })))
}

#[derive(Deserialize)]
pub struct UrlUpdate {
    pub current_url: String,
}

pub async fn update_url(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<UrlUpdate>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    ctx.sessions.update_url(&id, &body.current_url).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct ProfileStateUpdate {
    pub storage_state: Value,
}

/// PATCH /sessions/{id}/profile-state — persist the browser state back onto
/// the owning profile.
pub async fn update_profile_state(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<ProfileStateUpdate>,
) -> ApiResult<Json<Value>> {
    let session = ctx
        .sessions
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id}")))?;
    ctx.storage
        .update_profile_state(&session.profile_id, &body.storage_state.to_string())
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /sessions/{id}/retry — operator-confirmed re-queue of a failed
/// session (the automatic path only covers transient causes).
pub async fn retry_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    let decision = ctx
        .retry
        .force_retry(&id)
        .await
        .map_err(ApiError::from_transition)?;
    let session = ctx.sessions.get_required(&id).await?;
    Ok(Json(json!({ "success": true, "decision": decision, "session": session })))
}

pub async fn pause_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    let session = ctx
        .scheduler
        .pause_session(&id)
        .await
        .map_err(ApiError::from_transition)?;
    Ok(Json(json!({ "success": true, "session": session })))
}

pub async fn resume_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    let session = ctx
        .scheduler
        .resume_session(&id)
        .await
        .map_err(ApiError::from_transition)?;
    Ok(Json(json!({ "success": true, "session": session })))
}

pub async fn cancel_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    let session = ctx
        .scheduler
        .cancel_session(&id)
        .await
        .map_err(ApiError::from_transition)?;
    Ok(Json(json!({ "success": true, "session": session })))
}
