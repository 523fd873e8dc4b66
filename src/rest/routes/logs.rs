// rest/routes/logs.rs — Session log append and read.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::{ApiError, ApiResult};
use crate::storage::LogEntryInput;
use crate::AppContext;

/// POST /logs accepts a single entry object or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum LogsBody {
    One(LogEntryInput),
    Many(Vec<LogEntryInput>),
}

pub async fn append_logs(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<LogsBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let entries = match body {
        LogsBody::One(entry) => vec![entry],
        LogsBody::Many(entries) => entries,
    };
    if entries.is_empty() {
        return Err(ApiError::Validation("no log entries given".into()));
    }
    let mut written = 0usize;
    for entry in &entries {
        ctx.storage.append_log(entry).await?;
        written += 1;
    }
    Ok((StatusCode::CREATED, Json(json!({ "written": written }))))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
}

pub async fn session_logs(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    if ctx.sessions.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("session {id}")));
    }
    let logs = ctx.storage.list_logs(&id, query.limit.unwrap_or(500)).await?;
    Ok(Json(json!({ "logs": logs })))
}
