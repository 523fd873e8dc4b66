// rest/routes/scenarios.rs — Scenario authoring and validation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::{ApiError, ApiResult};
use crate::scenarios::validate_steps;
use crate::AppContext;

#[derive(Deserialize)]
pub struct CreateScenarioRequest {
    pub name: String,
    pub steps: Value,
}

/// POST /scenarios — author a scenario by hand. Steps must pass validation;
/// a scenario is immutable once stored valid.
pub async fn create_scenario(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateScenarioRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("scenario name must not be empty".into()));
    }
    let report = validate_steps(&body.steps);
    if !report.valid {
        return Err(ApiError::Validation(format!(
            "invalid steps: {}",
            report.errors.join("; ")
        )));
    }
    let steps: Vec<crate::model::Step> =
        serde_json::from_value(body.steps).map_err(|e| ApiError::Validation(e.to_string()))?;
    let (steps_json, step_count, estimated) = crate::scenarios::encode_steps(&steps);
    let scenario = ctx
        .storage
        .insert_scenario(&body.name, &steps_json, step_count, estimated, true, false)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "scenario": scenario, "warnings": report.warnings })),
    ))
}

pub async fn get_scenario(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match ctx.storage.get_scenario(&id).await? {
        Some(scenario) => Ok(Json(json!({ "scenario": scenario }))),
        None => Err(ApiError::not_found(format!("scenario {id}"))),
    }
}

/// POST /scenarios/{id}/validate — dry-run the stored steps and refresh the
/// validity flag.
pub async fn validate_scenario(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let scenario = ctx
        .storage
        .get_scenario(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("scenario {id}")))?;
    let raw: Value = serde_json::from_str(&scenario.steps)
        .unwrap_or(Value::Array(Vec::new()));
    let report = validate_steps(&raw);
    if report.valid != scenario.valid {
        ctx.storage.mark_scenario_valid(&id, report.valid).await?;
    }
    Ok(Json(json!({
        "valid": report.valid,
        "errors": report.errors,
        "warnings": report.warnings,
        "estimated_duration_seconds": report.estimated_duration_seconds,
    })))
}
