//! Retry & Resume engine.
//!
//! Invoked when a session lands in `error`. Policy comes from the live
//! scheduler config (`retry_on_failure`, `max_retries`); classification comes
//! from the analysis collaborator. Transient causes re-queue automatically,
//! everything else waits for operator confirmation via
//! `POST /sessions/:id/retry`. The re-queue itself is a single conditional
//! update so the retry bound holds even under concurrent engines.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::analysis::{FailureAnalyzer, FailureVerdict};
use crate::config::SharedSchedulerConfig;
use crate::model::SessionRow;
use crate::queue::ExecutionQueue;
use crate::sessions::SessionStore;
use crate::storage::Storage;

/// Log lines handed to the analyzer per failed session.
const ANALYSIS_LOG_TAIL: i64 = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Re-queued automatically; the next attempt starts at `resume_from_step`.
    Requeued {
        resume_from_step: i64,
        retry_count: i64,
        verdict: FailureVerdict,
    },
    /// Classified non-transient; left in `error` for operator confirmation.
    AwaitingConfirmation { verdict: FailureVerdict },
    /// Retry bound reached (or lost the re-queue race to it).
    Exhausted,
    /// `retry_on_failure` is off.
    Disabled,
}

#[derive(Clone)]
pub struct RetryEngine {
    config: SharedSchedulerConfig,
    sessions: SessionStore,
    queue: ExecutionQueue,
    storage: Storage,
    analyzer: Arc<dyn FailureAnalyzer>,
}

impl RetryEngine {
    pub fn new(
        config: SharedSchedulerConfig,
        sessions: SessionStore,
        queue: ExecutionQueue,
        storage: Storage,
        analyzer: Arc<dyn FailureAnalyzer>,
    ) -> Self {
        Self {
            config,
            sessions,
            queue,
            storage,
            analyzer,
        }
    }

    /// Decide what to do with a session that just entered `error`.
    pub async fn maybe_retry(&self, session: &SessionRow) -> Result<RetryDecision> {
        let policy = self.config.read().await.clone();
        if !policy.retry_on_failure {
            return Ok(RetryDecision::Disabled);
        }
        if session.retry_count >= policy.max_retries as i64 {
            return Ok(RetryDecision::Exhausted);
        }

        let logs = self
            .storage
            .list_logs(&session.id, ANALYSIS_LOG_TAIL)
            .await
            .unwrap_or_default();
        let verdict = self.analyzer.analyze(session, &logs).await;

        if !verdict.is_transient() {
            return Ok(RetryDecision::AwaitingConfirmation { verdict });
        }
        self.requeue(session, &verdict, policy.max_retries as i64)
            .await
    }

    /// Operator-confirmed retry, regardless of classification. Still bound by
    /// `max_retries` and only valid for sessions currently in `error`.
    pub async fn force_retry(&self, session_id: &str) -> Result<RetryDecision> {
        let session = self.sessions.get_required(session_id).await?;
        if session.status != "error" {
            return Err(
                crate::sessions::InvalidTransition::new(session_id, &session.status, "queued")
                    .into(),
            );
        }
        let policy = self.config.read().await.clone();
        if session.retry_count >= policy.max_retries as i64 {
            return Ok(RetryDecision::Exhausted);
        }
        let logs = self
            .storage
            .list_logs(&session.id, ANALYSIS_LOG_TAIL)
            .await
            .unwrap_or_default();
        let verdict = self.analyzer.analyze(&session, &logs).await;
        self.requeue(&session, &verdict, policy.max_retries as i64)
            .await
    }

    async fn requeue(
        &self,
        session: &SessionRow,
        verdict: &FailureVerdict,
        max_retries: i64,
    ) -> Result<RetryDecision> {
        let resume_from_step = resume_step(session, verdict);
        if !self
            .sessions
            .requeue_for_retry(&session.id, max_retries, resume_from_step)
            .await?
        {
            // Someone else consumed the last attempt, or the session moved on.
            return Ok(RetryDecision::Exhausted);
        }
        let retried = self.sessions.get_required(&session.id).await?;
        // Retried work jumps ahead of fresh priority-0 fan-outs.
        self.queue
            .reenqueue(&session.id, retried.retry_count)
            .await?;
        info!(
            session_id = %session.id,
            retry_count = retried.retry_count,
            resume_from_step,
            failure_type = %verdict.failure_type,
            "session re-queued for retry"
        );
        Ok(RetryDecision::Requeued {
            resume_from_step,
            retry_count: retried.retry_count,
            verdict: verdict.clone(),
        })
    }
}

/// Where the next attempt starts: the analysis checkpoint when resumable,
/// reconciled against the scenario length; step 0 otherwise.
fn resume_step(session: &SessionRow, verdict: &FailureVerdict) -> i64 {
    if !verdict.is_resumable {
        return 0;
    }
    let step = verdict
        .resume_from_step
        .or(session.last_successful_step.map(|s| s + 1))
        .unwrap_or(0);
    step.clamp(0, session.total_steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(resumable: bool, resume: Option<i64>) -> FailureVerdict {
        FailureVerdict {
            failure_type: "timeout".into(),
            is_resumable: resumable,
            resume_from_step: resume,
            confidence: 0.6,
            explanation: String::new(),
            ai_powered: false,
        }
    }

    fn session(total_steps: i64, last_successful: Option<i64>) -> SessionRow {
        SessionRow {
            id: "s".into(),
            profile_id: "p".into(),
            scenario_id: "sc".into(),
            task_id: None,
            status: "error".into(),
            progress: 0,
            current_step: 0,
            total_steps,
            runner_id: None,
            error: None,
            captcha_status: "none".into(),
            captcha_detected_at: None,
            captcha_resolved_at: None,
            is_resumable: true,
            last_successful_step: last_successful,
            retry_count: 0,
            current_url: None,
            last_screenshot: None,
            metadata: None,
            created_at: 0,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
        }
    }

    #[test]
    fn resume_step_prefers_verdict_then_checkpoint() {
        assert_eq!(resume_step(&session(10, Some(3)), &verdict(true, Some(6))), 6);
        assert_eq!(resume_step(&session(10, Some(3)), &verdict(true, None)), 4);
        assert_eq!(resume_step(&session(10, Some(3)), &verdict(false, Some(6))), 0);
    }

    #[test]
    fn resume_step_reconciles_against_scenario_length() {
        assert_eq!(resume_step(&session(5, None), &verdict(true, Some(12))), 5);
        assert_eq!(resume_step(&session(5, None), &verdict(true, Some(-2))), 0);
    }
}
