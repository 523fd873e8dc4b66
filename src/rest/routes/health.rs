// rest/routes/health.rs — Daemon self-health probe.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::rest::error::ApiResult;
use crate::AppContext;

/// GET /healthz — liveness probe for the daemon itself (the POST /health
/// endpoint is runner heartbeats, not this).
pub async fn healthz(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Value>> {
    let db_ok = ctx.storage.db_ok().await;
    let depth = ctx.queue.depth().await.unwrap_or(0);
    Ok(Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "daemon_id": ctx.daemon_id,
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "db_ok": db_ok,
        "queue_depth": depth,
    })))
}
