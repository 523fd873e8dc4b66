// rest/routes/config.rs — Live scheduler policy inspection and updates.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::rest::error::{ApiError, ApiResult};
use crate::AppContext;

/// GET /config — the effective daemon configuration. The scheduler section
/// reflects live state, which may differ from config.toml until the next save.
pub async fn get_config(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Value>> {
    let scheduler = ctx.scheduler_config.read().await.clone();
    Ok(Json(json!({
        "port": ctx.config.port,
        "bind_address": ctx.config.bind_address,
        "scheduler": scheduler,
        "health": ctx.config.health,
    })))
}

/// PUT /config/scheduler — replace the scheduling policy. Takes effect on the
/// next claim attempt; in-flight leases are untouched. Persisted back to
/// config.toml so a restart keeps the new policy.
pub async fn update_scheduler(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SchedulerConfig>,
) -> ApiResult<Json<Value>> {
    if body.max_delay_ms < body.min_delay_ms {
        return Err(ApiError::Validation(format!(
            "max_delay_ms ({}) must be >= min_delay_ms ({})",
            body.max_delay_ms, body.min_delay_ms
        )));
    }
    if body.max_concurrency == 0 {
        return Err(ApiError::Validation(
            "max_concurrency must be at least 1".into(),
        ));
    }

    {
        let mut live = ctx.scheduler_config.write().await;
        *live = body.clone();
    }

    let mut persisted = ctx.config.as_ref().clone();
    persisted.scheduler = body.clone();
    persisted.save(&ctx.data_dir).await?;

    info!(
        max_concurrency = body.max_concurrency,
        active = body.active,
        "scheduler config updated"
    );
    Ok(Json(json!({ "scheduler": body })))
}
