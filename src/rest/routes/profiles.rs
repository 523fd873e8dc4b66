// rest/routes/profiles.rs — Browser profile registry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::{ApiError, ApiResult};
use crate::AppContext;

#[derive(Deserialize)]
pub struct CreateProfileRequest {
    pub name: String,
    pub proxy: Option<String>,
    pub fingerprint: Option<String>,
}

pub async fn create_profile(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateProfileRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("profile name must not be empty".into()));
    }
    let profile = ctx
        .storage
        .create_profile(&body.name, body.proxy.as_deref(), body.fingerprint.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "profile": profile }))))
}

pub async fn list_profiles(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Value>> {
    let profiles = ctx.storage.list_profiles().await?;
    Ok(Json(json!({ "profiles": profiles })))
}

pub async fn get_profile(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match ctx.storage.get_profile(&id).await? {
        Some(profile) => Ok(Json(json!({ "profile": profile }))),
        None => Err(ApiError::not_found(format!("profile {id}"))),
    }
}
