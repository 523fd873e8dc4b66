//! Scheduler: the claim flow runners poll, and the completion flow that
//! finalizes sessions.
//!
//! Coordination happens entirely through the durable queue and session rows —
//! runners share no in-process state. The per-runner concurrency gate and the
//! live policy are consulted on every claim attempt; the claim itself is the
//! queue's conditional update. The advisory start delay is anti-detection
//! pacing only and is never enforced server-side.

use anyhow::Result;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{SchedulerConfig, SharedSchedulerConfig};
use crate::model::{ProfileRow, ScenarioRow, SessionRow};
use crate::queue::ExecutionQueue;
use crate::retry::{RetryDecision, RetryEngine};
use crate::sessions::SessionStore;
use crate::storage::Storage;
use crate::tasks::Orchestrator;

/// Joined payload a runner needs to execute one claimed session.
#[derive(Debug, Clone, Serialize)]
pub struct JobPayload {
    pub job_id: String,
    pub session: SessionRow,
    pub scenario: ScenarioRow,
    pub profile: ProfileRow,
    pub delay_before_start_ms: u64,
}

/// Outcome of one claim attempt. Capacity and no-work are distinct signals so
/// runners can pick the right backoff.
#[derive(Debug)]
pub enum ClaimOutcome {
    Job(Box<JobPayload>),
    NoWork,
    Capacity { running: i64, max: u32 },
}

#[derive(Clone)]
pub struct Scheduler {
    config: SharedSchedulerConfig,
    storage: Storage,
    sessions: SessionStore,
    queue: ExecutionQueue,
    retry: RetryEngine,
    orchestrator: Orchestrator,
}

impl Scheduler {
    pub fn new(
        config: SharedSchedulerConfig,
        storage: Storage,
        sessions: SessionStore,
        queue: ExecutionQueue,
        retry: RetryEngine,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            config,
            storage,
            sessions,
            queue,
            retry,
            orchestrator,
        }
    }

    // ─── Claim flow ──────────────────────────────────────────────────────────

    /// One poll cycle for `runner_id`: policy gate, capacity gate, then claim
    /// candidates until one session actually starts.
    pub async fn claim(&self, runner_id: &str) -> Result<ClaimOutcome> {
        let policy = self.config.read().await.clone();
        if !policy.active {
            return Ok(ClaimOutcome::NoWork);
        }

        let running = self.sessions.running_count_for_runner(runner_id).await?;
        if running >= policy.max_concurrency as i64 {
            debug!(runner_id, running, max = policy.max_concurrency, "claim refused: at capacity");
            return Ok(ClaimOutcome::Capacity {
                running,
                max: policy.max_concurrency,
            });
        }

        // A claimed entry can reference a session an operator has since moved;
        // skip those and keep claiming. Bounded so a pathological queue state
        // cannot spin this loop forever.
        for _ in 0..10 {
            let Some(entry) = self.queue.claim_next(runner_id).await? else {
                return Ok(ClaimOutcome::NoWork);
            };
            match self.start_claimed(&entry.session_id, runner_id).await? {
                Some(payload) => {
                    info!(
                        runner_id,
                        session_id = %payload.session.id,
                        priority = entry.priority,
                        delay_ms = payload.delay_before_start_ms,
                        "job claimed"
                    );
                    return Ok(ClaimOutcome::Job(Box::new(payload)));
                }
                None => continue,
            }
        }
        Ok(ClaimOutcome::NoWork)
    }

    /// Transition the claimed session to running and assemble the payload.
    /// Returns None (after cleaning up the entry) when the session cannot
    /// start — the caller moves to the next candidate.
    async fn start_claimed(&self, session_id: &str, runner_id: &str) -> Result<Option<JobPayload>> {
        let Some(session) = self.sessions.get(session_id).await? else {
            warn!(session_id, "queue entry references a missing session; dropping");
            self.queue.release(session_id).await?;
            return Ok(None);
        };
        let Some(scenario) = self.storage.get_scenario(&session.scenario_id).await? else {
            warn!(session_id, scenario_id = %session.scenario_id, "session references a missing scenario; dropping entry");
            self.queue.release(session_id).await?;
            return Ok(None);
        };

        if !self
            .sessions
            .mark_running(session_id, runner_id, scenario.step_count)
            .await?
        {
            // Operator moved the session between enqueue and claim.
            let current = self.sessions.get(session_id).await?;
            match current {
                Some(s) if crate::model::is_terminal_session_status(&s.status) => {
                    self.queue.release(session_id).await?;
                }
                _ => {
                    self.queue.unclaim(session_id).await?;
                }
            }
            return Ok(None);
        }

        let session = self.sessions.get_required(session_id).await?;
        let Some(profile) = self.storage.get_profile(&session.profile_id).await? else {
            // Should not happen: profiles are verified at fan-out.
            warn!(session_id, profile_id = %session.profile_id, "claimed session has no profile; failing it");
            self.fail_session(session_id, "profile record missing").await?;
            return Ok(None);
        };

        let policy = self.config.read().await.clone();
        Ok(Some(JobPayload {
            job_id: session.id.clone(),
            delay_before_start_ms: start_delay_ms(&policy),
            session,
            scenario,
            profile,
        }))
    }

    // ─── Completion flow ─────────────────────────────────────────────────────

    /// Finalize a running session as `success`: release the lease, credit the
    /// profile, and let the orchestrator re-check the task aggregate.
    pub async fn complete_session(&self, session_id: &str) -> Result<SessionRow> {
        let session = self.sessions.finish(session_id, "success", None).await?;
        self.queue.release(session_id).await?;
        self.storage.record_profile_run(&session.profile_id).await?;
        self.orchestrator.record_session_terminal(&session).await?;
        Ok(session)
    }

    /// Finalize a running session as `error`, then hand it to the Retry
    /// Engine. Only sessions the engine does not re-queue count into the
    /// owning task's failed aggregate.
    pub async fn fail_session(
        &self,
        session_id: &str,
        error: &str,
    ) -> Result<(SessionRow, RetryDecision)> {
        let session = self.sessions.finish(session_id, "error", Some(error)).await?;
        self.queue.release(session_id).await?;

        let decision = self.retry.maybe_retry(&session).await?;
        match &decision {
            RetryDecision::Requeued { .. } => {}
            _ => self.orchestrator.record_session_terminal(&session).await?,
        }
        Ok((session, decision))
    }

    /// Operator cancel of one session: guarded transition, lease released,
    /// aggregate updated. An already-executing runner observes the status on
    /// its next report.
    pub async fn cancel_session(&self, session_id: &str) -> Result<SessionRow> {
        let session = self.sessions.transition(session_id, "cancelled").await?;
        self.queue.release(session_id).await?;
        self.orchestrator.record_session_terminal(&session).await?;
        Ok(session)
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<SessionRow> {
        let session = self.sessions.transition(session_id, "paused").await?;
        self.queue.release(session_id).await?;
        Ok(session)
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<SessionRow> {
        let session = self.sessions.transition(session_id, "queued").await?;
        self.queue
            .reenqueue(session_id, crate::tasks::RESUME_PRIORITY)
            .await?;
        Ok(session)
    }
}

/// Advisory start delay: fixed at the minimum, or uniform in
/// `[min_delay_ms, max_delay_ms)` when randomization is on.
pub fn start_delay_ms(policy: &SchedulerConfig) -> u64 {
    if !policy.randomize_delays || policy.max_delay_ms <= policy.min_delay_ms {
        return policy.min_delay_ms;
    }
    rand::thread_rng().gen_range(policy.min_delay_ms..policy.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_when_randomization_off() {
        let policy = SchedulerConfig {
            randomize_delays: false,
            min_delay_ms: 1_500,
            max_delay_ms: 9_000,
            ..Default::default()
        };
        for _ in 0..10 {
            assert_eq!(start_delay_ms(&policy), 1_500);
        }
    }

    #[test]
    fn randomized_delay_stays_in_bounds() {
        let policy = SchedulerConfig {
            randomize_delays: true,
            min_delay_ms: 100,
            max_delay_ms: 200,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = start_delay_ms(&policy);
            assert!((100..200).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn degenerate_bounds_fall_back_to_min() {
        let policy = SchedulerConfig {
            randomize_delays: true,
            min_delay_ms: 500,
            max_delay_ms: 500,
            ..Default::default()
        };
        assert_eq!(start_delay_ms(&policy), 500);
    }
}
