//! Session lifecycle storage and state machine guards.
//!
//! Every transition goes through a conditional UPDATE keyed on the expected
//! current status, so concurrent writers cannot push a session through an
//! invalid edge. Terminal statuses (success, error, cancelled) reject all
//! further transitions; the single sanctioned exception — the Retry Engine's
//! error → queued re-queue — is its own conditional update with its own
//! guards, not a normal transition.

use anyhow::{anyhow, bail, Result};
use sqlx::SqlitePool;

use crate::model::{
    is_valid_captcha_status, new_id, now_ms, valid_session_transition, SessionRow,
};
use crate::storage::with_timeout;

/// A lifecycle move the state machine refuses. Carried inside `anyhow` so
/// the REST layer can answer 409 for rejected transitions while genuine
/// store failures stay 500.
#[derive(Debug, thiserror::Error)]
#[error("invalid transition: {from} -> {to} for session {id}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub(crate) fn new(id: &str, from: &str, to: &str) -> Self {
        Self {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ─── Creation / lookup ───────────────────────────────────────────────────

    pub async fn create(
        &self,
        profile_id: &str,
        scenario_id: &str,
        task_id: Option<&str>,
        total_steps: i64,
    ) -> Result<SessionRow> {
        let id = new_id();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO sessions (id, profile_id, scenario_id, task_id, status, total_steps, created_at) \
                 VALUES (?, ?, ?, ?, 'queued', ?, ?)",
            )
            .bind(&id)
            .bind(profile_id)
            .bind(scenario_id)
            .bind(task_id)
            .bind(total_steps)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.get_required(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn get_required(&self, id: &str) -> Result<SessionRow> {
        self.get(id)
            .await?
            .ok_or_else(|| anyhow!("session {id} not found"))
    }

    pub async fn list(&self, status: Option<&str>, limit: i64) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            match status {
                Some(s) => Ok(sqlx::query_as(
                    "SELECT * FROM sessions WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(s)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?),
                None => Ok(sqlx::query_as(
                    "SELECT * FROM sessions ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?),
            }
        })
        .await
    }

    pub async fn list_for_task(&self, task_id: &str) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM sessions WHERE task_id = ? ORDER BY created_at ASC",
            )
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Count of `running` sessions assigned to one runner — the per-runner
    /// concurrency gate reads this on every claim attempt.
    pub async fn running_count_for_runner(&self, runner_id: &str) -> Result<i64> {
        with_timeout(async {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sessions WHERE runner_id = ? AND status = 'running'",
            )
            .bind(runner_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(n)
        })
        .await
    }

    // ─── Transitions ─────────────────────────────────────────────────────────

    /// Claim side of the queue handshake: queued → running, recording the
    /// runner, start time, and the scenario's step count. The WHERE guard on
    /// the current status makes this safe against concurrent operators.
    pub async fn mark_running(
        &self,
        id: &str,
        runner_id: &str,
        total_steps: i64,
    ) -> Result<bool> {
        with_timeout(async {
            let n = sqlx::query(
                "UPDATE sessions SET status = 'running', runner_id = ?, started_at = ?, \
                 total_steps = ?, error = NULL WHERE id = ? AND status = 'queued'",
            )
            .bind(runner_id)
            .bind(now_ms())
            .bind(total_steps)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n == 1)
        })
        .await
    }

    /// Runner progress report. Progress and current step are clamped
    /// monotonic non-decreasing within the attempt; reports against a
    /// non-running session are ignored (stale runner writes after a pause or
    /// cancel are expected, not errors).
    pub async fn update_progress(&self, id: &str, progress: i64, current_step: i64) -> Result<bool> {
        if !(0..=100).contains(&progress) {
            bail!("progress must be 0-100, got {progress}");
        }
        with_timeout(async {
            let n = sqlx::query(
                "UPDATE sessions SET progress = MAX(progress, ?), current_step = MAX(current_step, ?) \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(progress)
            .bind(current_step)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n == 1)
        })
        .await
    }

    /// Finalize a running session as `success` or `error`, stamping
    /// `completed_at` and deriving `execution_time_ms` from `started_at`.
    pub async fn finish(&self, id: &str, status: &str, error: Option<&str>) -> Result<SessionRow> {
        if status != "success" && status != "error" {
            bail!("finish expects success or error, got {status}");
        }
        let now = now_ms();
        let n = with_timeout(async {
            Ok(sqlx::query(
                "UPDATE sessions SET status = ?, error = ?, completed_at = ?, \
                 execution_time_ms = ? - COALESCE(started_at, ?), \
                 progress = CASE WHEN ? = 'success' THEN 100 ELSE progress END \
                 WHERE id = ? AND status = 'running'",
            )
            .bind(status)
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected())
        })
        .await?;
        if n == 0 {
            let current = self.get_required(id).await?;
            return Err(InvalidTransition::new(id, &current.status, status).into());
        }
        self.get_required(id).await
    }

    /// General guarded transition for the pause / resume / cancel edges.
    /// Transitions out of a terminal status are an error, never a no-op.
    pub async fn transition(&self, id: &str, to: &str) -> Result<SessionRow> {
        let current = self.get_required(id).await?;
        if !valid_session_transition(&current.status, to) {
            return Err(InvalidTransition::new(id, &current.status, to).into());
        }
        let now = now_ms();
        let n = with_timeout(async {
            Ok(if to == "cancelled" {
                sqlx::query(
                    "UPDATE sessions SET status = 'cancelled', completed_at = ? \
                     WHERE id = ? AND status = ?",
                )
                .bind(now)
                .bind(id)
                .bind(&current.status)
                .execute(&self.pool)
                .await?
                .rows_affected()
            } else {
                sqlx::query("UPDATE sessions SET status = ? WHERE id = ? AND status = ?")
                    .bind(to)
                    .bind(id)
                    .bind(&current.status)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            })
        })
        .await?;
        if n == 0 {
            // Lost a race with another writer; re-read and report the status
            // that actually won.
            let after = self.get_required(id).await?;
            return Err(InvalidTransition::new(id, &after.status, to).into());
        }
        self.get_required(id).await
    }

    /// Retry Engine re-queue: error → queued in one conditional update that
    /// also enforces the retry bound and resets attempt-scoped fields.
    /// `resume_step` is where the next attempt starts (0 = from the top).
    pub async fn requeue_for_retry(
        &self,
        id: &str,
        max_retries: i64,
        resume_step: i64,
    ) -> Result<bool> {
        with_timeout(async {
            let n = sqlx::query(
                "UPDATE sessions SET status = 'queued', error = NULL, \
                 retry_count = retry_count + 1, progress = 0, current_step = ?, \
                 runner_id = NULL, started_at = NULL, completed_at = NULL, \
                 execution_time_ms = NULL \
                 WHERE id = ? AND status = 'error' AND retry_count < ?",
            )
            .bind(resume_step)
            .bind(id)
            .bind(max_retries)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n == 1)
        })
        .await
    }

    // ─── Sub-state and auxiliary fields ──────────────────────────────────────

    /// Update the captcha sub-state. Independent of the primary status:
    /// detection never pauses or fails the session by itself.
    pub async fn update_captcha(&self, id: &str, captcha_status: &str) -> Result<SessionRow> {
        if !is_valid_captcha_status(captcha_status) {
            bail!("invalid captcha status: {captcha_status}");
        }
        let now = now_ms();
        with_timeout(async {
            match captcha_status {
                "detected" => {
                    sqlx::query(
                        "UPDATE sessions SET captcha_status = ?, captcha_detected_at = ?, \
                         captcha_resolved_at = NULL WHERE id = ?",
                    )
                    .bind(captcha_status)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
                "solved" | "failed" => {
                    sqlx::query(
                        "UPDATE sessions SET captcha_status = ?, captcha_resolved_at = ? WHERE id = ?",
                    )
                    .bind(captcha_status)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
                _ => {
                    sqlx::query("UPDATE sessions SET captcha_status = ? WHERE id = ?")
                        .bind(captcha_status)
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
            Ok(())
        })
        .await?;
        self.get_required(id).await
    }

    /// Record the resume checkpoint reported by the runner or derived from
    /// failure analysis.
    pub async fn set_resumable(
        &self,
        id: &str,
        is_resumable: bool,
        last_successful_step: Option<i64>,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "UPDATE sessions SET is_resumable = ?, last_successful_step = ? WHERE id = ?",
            )
            .bind(is_resumable)
            .bind(last_successful_step)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn update_url(&self, id: &str, current_url: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET current_url = ? WHERE id = ?")
                .bind(current_url)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn update_screenshot(&self, id: &str, screenshot_ref: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET last_screenshot = ? WHERE id = ?")
                .bind(screenshot_ref)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn merge_metadata(&self, id: &str, patch: &serde_json::Value) -> Result<()> {
        let current = self.get_required(id).await?;
        let mut merged: serde_json::Map<String, serde_json::Value> = current
            .metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        if let Some(obj) = patch.as_object() {
            for (k, v) in obj {
                merged.insert(k.clone(), v.clone());
            }
        }
        let raw = serde_json::Value::Object(merged).to_string();
        with_timeout(async {
            sqlx::query("UPDATE sessions SET metadata = ? WHERE id = ?")
                .bind(&raw)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Sessions stuck in `running` whose runner has not heartbeated since
    /// `cutoff_ms`. A runner with no heartbeat row at all gets the same
    /// grace, measured from the session's own start time. Input to the
    /// stale-lease reaper.
    pub async fn stale_running(&self, cutoff_ms: i64) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT s.* FROM sessions s \
                 LEFT JOIN runners r ON r.id = s.runner_id \
                 WHERE s.status = 'running' \
                   AND ((r.id IS NULL AND s.started_at < ?) OR r.last_heartbeat < ?)",
            )
            .bind(cutoff_ms)
            .bind(cutoff_ms)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn store() -> SessionStore {
        let storage = Storage::in_memory().await.unwrap();
        SessionStore::new(storage.pool())
    }

    #[tokio::test]
    async fn mark_running_sets_attempt_fields() {
        let s = store().await;
        let session = s.create("p1", "sc1", None, 0).await.unwrap();
        assert!(s.mark_running(&session.id, "r1", 7).await.unwrap());

        let running = s.get_required(&session.id).await.unwrap();
        assert_eq!(running.status, "running");
        assert_eq!(running.runner_id.as_deref(), Some("r1"));
        assert_eq!(running.total_steps, 7);
        assert!(running.started_at.is_some());

        // Second claim on the same session must fail the guard.
        assert!(!s.mark_running(&session.id, "r2", 7).await.unwrap());
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_attempt() {
        let s = store().await;
        let session = s.create("p1", "sc1", None, 10).await.unwrap();
        s.mark_running(&session.id, "r1", 10).await.unwrap();

        assert!(s.update_progress(&session.id, 40, 4).await.unwrap());
        assert!(s.update_progress(&session.id, 20, 2).await.unwrap());

        let row = s.get_required(&session.id).await.unwrap();
        assert_eq!(row.progress, 40, "regressing report must not lower progress");
        assert_eq!(row.current_step, 4);
    }

    #[tokio::test]
    async fn finish_computes_execution_time_and_rejects_repeat() {
        let s = store().await;
        let session = s.create("p1", "sc1", None, 3).await.unwrap();
        s.mark_running(&session.id, "r1", 3).await.unwrap();

        let done = s.finish(&session.id, "success", None).await.unwrap();
        assert_eq!(done.status, "success");
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
        assert!(done.execution_time_ms.unwrap() >= 0);

        // Terminal is final.
        assert!(s.finish(&session.id, "error", Some("late")).await.is_err());
        assert!(s.transition(&session.id, "queued").await.is_err());
    }

    #[tokio::test]
    async fn terminal_rejects_all_transitions() {
        let s = store().await;
        let session = s.create("p1", "sc1", None, 3).await.unwrap();
        let cancelled = s.transition(&session.id, "cancelled").await.unwrap();
        assert_eq!(cancelled.status, "cancelled");
        for target in ["queued", "running", "paused", "cancelled"] {
            let err = s
                .transition(&session.id, target)
                .await
                .expect_err(&format!("cancelled -> {target} must be rejected"));
            assert!(
                err.downcast_ref::<InvalidTransition>().is_some(),
                "rejection must carry the typed error, got: {err}"
            );
        }
    }

    #[tokio::test]
    async fn requeue_for_retry_respects_bound() {
        let s = store().await;
        let session = s.create("p1", "sc1", None, 5).await.unwrap();
        s.mark_running(&session.id, "r1", 5).await.unwrap();
        s.finish(&session.id, "error", Some("net::ERR_TIMED_OUT"))
            .await
            .unwrap();

        assert!(s.requeue_for_retry(&session.id, 1, 0).await.unwrap());
        let retried = s.get_required(&session.id).await.unwrap();
        assert_eq!(retried.status, "queued");
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());
        assert!(retried.runner_id.is_none());

        // Exhaust the bound: fail again, then the conditional update refuses.
        s.mark_running(&session.id, "r1", 5).await.unwrap();
        s.finish(&session.id, "error", Some("timeout")).await.unwrap();
        assert!(!s.requeue_for_retry(&session.id, 1, 0).await.unwrap());
    }

    #[tokio::test]
    async fn captcha_substate_is_independent() {
        let s = store().await;
        let session = s.create("p1", "sc1", None, 5).await.unwrap();
        s.mark_running(&session.id, "r1", 5).await.unwrap();

        let detected = s.update_captcha(&session.id, "detected").await.unwrap();
        assert_eq!(detected.status, "running", "detection must not change status");
        assert_eq!(detected.captcha_status, "detected");
        assert!(detected.captcha_detected_at.is_some());

        let solved = s.update_captcha(&session.id, "solved").await.unwrap();
        assert!(solved.captcha_resolved_at.is_some());

        assert!(s.update_captcha(&session.id, "bogus").await.is_err());
    }
}
