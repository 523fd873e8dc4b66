//! REST error taxonomy.
//!
//! Every failure surfaces as a structured JSON body with a stable `error`
//! field — no endpoint returns unstructured stack traces. Claim conflicts
//! never appear here: they are resolved internally by moving to the next
//! queue candidate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    /// The runner is at its concurrency ceiling — distinct from "no work" so
    /// pollers can pick the right backoff.
    #[error("runner at capacity ({running}/{max})")]
    CapacityExceeded { running: i64, max: u32 },
    /// Invalid state transition (e.g. touching a terminal session).
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} not found"))
    }

    /// Classify a session lifecycle failure: a refused transition is a 409
    /// conflict, anything else (a store fault, a collaborator fault) stays
    /// an internal 500.
    pub fn from_transition(e: anyhow::Error) -> Self {
        match e.downcast::<crate::sessions::InvalidTransition>() {
            Ok(rejected) => Self::Conflict(rejected.to_string()),
            Err(e) => Self::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::CapacityExceeded { running, max } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string(), "running": running, "max_concurrency": max }),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::Internal(e) => {
                error!("internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::InvalidTransition;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn rejected_transitions_map_to_conflict() {
        let err = anyhow::Error::new(InvalidTransition::new("s1", "success", "paused"));
        assert_eq!(
            status_of(ApiError::from_transition(err)),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn store_faults_map_to_internal() {
        let err = anyhow::anyhow!("database is gone");
        assert_eq!(
            status_of(ApiError::from_transition(err)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
