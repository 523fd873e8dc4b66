//! Task orchestration: fan-out, bulk lifecycle, and outcome aggregation.
//!
//! A task is a work order that fans out into `profiles × run_count` sessions.
//! Completion is detected by polling aggregates, not pushed: the counters on
//! the task row are refreshed from the sessions table on every terminal
//! transition (and by a background sweep as a safety net), then a conditional
//! update closes the task exactly once.

pub mod jobs;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::model::{
    new_id, now_ms, valid_task_transition, BehaviorConfig, ScenarioRow, SessionRow, TaskRow,
};
use crate::queue::ExecutionQueue;
use crate::scenarios::compiler::{CompileRequest, ScenarioCompiler};
use crate::sessions::SessionStore;
use crate::storage::{with_timeout, Storage};

/// Priority for sessions re-entering the queue after a task resume. Raised
/// above fresh fan-outs (priority 0) so paused work is served first.
pub const RESUME_PRIORITY: i64 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub goal: String,
    #[serde(default)]
    pub entry_url: Option<String>,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub profile_ids: Vec<String>,
    #[serde(default = "default_run_count")]
    pub run_count: i64,
    #[serde(default)]
    pub behavior_config: Option<BehaviorConfig>,
}

fn default_run_count() -> i64 {
    1
}

/// Result of `start`: how many sessions were fanned out.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FanOut {
    pub created: i64,
    pub sessions: Vec<String>,
}

// ─── TaskStore ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &NewTask) -> Result<TaskRow> {
        if input.goal.trim().is_empty() {
            bail!("task goal must not be empty");
        }
        if input.run_count < 1 {
            bail!("run_count must be at least 1, got {}", input.run_count);
        }
        let id = new_id();
        let profile_ids = serde_json::to_string(&input.profile_ids)?;
        let behavior = input
            .behavior_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        with_timeout(async {
            sqlx::query(
                "INSERT INTO tasks \
                 (id, goal, entry_url, search_query, profile_ids, run_count, behavior_config, status, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'draft', ?)",
            )
            .bind(&id)
            .bind(&input.goal)
            .bind(&input.entry_url)
            .bind(&input.search_query)
            .bind(&profile_ids)
            .bind(input.run_count)
            .bind(&behavior)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.get_required(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<TaskRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn get_required(&self, id: &str) -> Result<TaskRow> {
        self.get(id).await?.ok_or_else(|| anyhow!("task {id} not found"))
    }

    pub async fn list(&self, status: Option<&str>) -> Result<Vec<TaskRow>> {
        with_timeout(async {
            match status {
                Some(s) => Ok(sqlx::query_as(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(s)
                .fetch_all(&self.pool)
                .await?),
                None => Ok(
                    sqlx::query_as("SELECT * FROM tasks ORDER BY created_at DESC")
                        .fetch_all(&self.pool)
                        .await?,
                ),
            }
        })
        .await
    }

    pub async fn link_scenario(&self, id: &str, scenario_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE tasks SET scenario_id = ? WHERE id = ?")
                .bind(scenario_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Guarded task status transition, stamping started/completed times.
    pub async fn transition(&self, id: &str, to: &str) -> Result<TaskRow> {
        let current = self.get_required(id).await?;
        if !valid_task_transition(&current.status, to) {
            bail!("invalid task transition: {} -> {to} for {id}", current.status);
        }
        let now = now_ms();
        with_timeout(async {
            match to {
                "active" if current.started_at.is_none() => {
                    sqlx::query("UPDATE tasks SET status = ?, started_at = ? WHERE id = ?")
                        .bind(to)
                        .bind(now)
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
                "completed" | "cancelled" => {
                    sqlx::query("UPDATE tasks SET status = ?, completed_at = ? WHERE id = ?")
                        .bind(to)
                        .bind(now)
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
                _ => {
                    sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
                        .bind(to)
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

    /// Fan a task out atomically: every session row, its queue entry, the
    /// counter, and the draft → active move commit together. A failure
    /// mid-way rolls the whole fan-out back instead of leaving claimable
    /// sessions attached to a draft task.
    pub async fn fan_out(
        &self,
        id: &str,
        scenario: &ScenarioRow,
        profile_ids: &[String],
        run_count: i64,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut session_ids = Vec::new();
        for profile_id in profile_ids {
            for _ in 0..run_count {
                let session_id = new_id();
                let now = now_ms();
                sqlx::query(
                    "INSERT INTO sessions \
                     (id, profile_id, scenario_id, task_id, status, total_steps, created_at) \
                     VALUES (?, ?, ?, ?, 'queued', ?, ?)",
                )
                .bind(&session_id)
                .bind(profile_id)
                .bind(&scenario.id)
                .bind(id)
                .bind(scenario.step_count)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO queue_entries (session_id, priority, created_at) \
                     VALUES (?, 0, ?)",
                )
                .bind(&session_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                session_ids.push(session_id);
            }
        }
        let n = sqlx::query(
            "UPDATE tasks SET status = 'active', started_at = ?, sessions_created = ? \
             WHERE id = ? AND status = 'draft'",
        )
        .bind(now_ms())
        .bind(session_ids.len() as i64)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if n == 0 {
            // The task left draft under us; discard the fan-out.
            tx.rollback().await?;
            let current = self.get_required(id).await?;
            bail!("task {id} is {}, only draft tasks can start", current.status);
        }
        tx.commit().await?;
        Ok(session_ids)
    }

    /// Refresh the denormalized outcome counters from the sessions table.
    /// Idempotent and self-healing; a retried session drops back out of the
    /// failed count on the next refresh.
    pub async fn refresh_aggregates(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "UPDATE tasks SET \
                   sessions_completed = (SELECT COUNT(*) FROM sessions \
                                         WHERE task_id = tasks.id AND status = 'success'), \
                   sessions_failed = (SELECT COUNT(*) FROM sessions \
                                      WHERE task_id = tasks.id AND status IN ('error', 'cancelled')) \
                 WHERE id = ?",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Close the task once every session is accounted for. The WHERE clause
    /// makes this fire exactly once and never before the aggregate is full.
    pub async fn try_complete(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let n = sqlx::query(
                "UPDATE tasks SET status = 'completed', completed_at = ? \
                 WHERE id = ? AND status = 'active' AND sessions_created > 0 \
                   AND sessions_completed + sessions_failed >= sessions_created",
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n == 1)
        })
        .await
    }

    pub async fn active_ids(&self) -> Result<Vec<String>> {
        with_timeout(async {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT id FROM tasks WHERE status = 'active'")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
        .await
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Orchestrator {
    tasks: TaskStore,
    sessions: SessionStore,
    queue: ExecutionQueue,
    storage: Storage,
}

impl Orchestrator {
    pub fn new(
        tasks: TaskStore,
        sessions: SessionStore,
        queue: ExecutionQueue,
        storage: Storage,
    ) -> Self {
        Self {
            tasks,
            sessions,
            queue,
            storage,
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub async fn create(&self, input: &NewTask) -> Result<TaskRow> {
        self.tasks.create(input).await
    }

    /// Compile a scenario from the task's intent via the collaborator, store
    /// it, and link it to the task.
    pub async fn generate_scenario(
        &self,
        task_id: &str,
        compiler: &dyn ScenarioCompiler,
    ) -> Result<ScenarioRow> {
        let task = self.tasks.get_required(task_id).await?;
        let behavior: BehaviorConfig = task
            .behavior_config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let compiled = compiler
            .compile(&CompileRequest {
                goal: task.goal.clone(),
                entry_url: task.entry_url.clone(),
                search_query: task.search_query.clone(),
                behavior,
            })
            .await?;

        let report = crate::scenarios::validate_steps(&serde_json::to_value(&compiled.steps)?);
        if !report.valid {
            bail!(
                "compiled scenario failed validation: {}",
                report.errors.join("; ")
            );
        }
        let (steps_json, step_count, estimated) = crate::scenarios::encode_steps(&compiled.steps);
        let scenario = self
            .storage
            .insert_scenario(&compiled.name, &steps_json, step_count, estimated, true, true)
            .await?;
        self.tasks.link_scenario(task_id, &scenario.id).await?;
        info!(task_id, scenario_id = %scenario.id, steps = step_count, ai_powered = compiled.ai_powered, "scenario generated");
        Ok(scenario)
    }

    /// Fan the task out: one session per (profile, run) pair, all referencing
    /// the same scenario, each enqueued at priority 0.
    pub async fn start(&self, task_id: &str) -> Result<FanOut> {
        let task = self.tasks.get_required(task_id).await?;
        if task.status != "draft" {
            bail!("task {task_id} is {}, only draft tasks can start", task.status);
        }
        let scenario_id = task
            .scenario_id
            .as_deref()
            .ok_or_else(|| anyhow!("task {task_id} has no generated scenario"))?;
        let scenario = self
            .storage
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| anyhow!("scenario {scenario_id} not found"))?;
        let profile_ids = task.profile_id_list();
        if profile_ids.is_empty() {
            bail!("task {task_id} has no profiles");
        }
        for profile_id in &profile_ids {
            if self.storage.get_profile(profile_id).await?.is_none() {
                bail!("profile {profile_id} not found");
            }
        }

        let session_ids = self
            .tasks
            .fan_out(task_id, &scenario, &profile_ids, task.run_count)
            .await?;
        let created = session_ids.len() as i64;
        info!(task_id, created, profiles = profile_ids.len(), run_count = task.run_count, "task started");
        Ok(FanOut {
            created,
            sessions: session_ids,
        })
    }

    /// Pause: running and queued sessions go to `paused`; queued entries leave
    /// the queue until resume re-enters them.
    pub async fn pause(&self, task_id: &str) -> Result<TaskRow> {
        let task = self.tasks.transition(task_id, "paused").await?;
        for session in self.sessions.list_for_task(task_id).await? {
            if session.status == "running" || session.status == "queued" {
                self.sessions.transition(&session.id, "paused").await?;
                self.queue.release(&session.id).await?;
            }
        }
        Ok(task)
    }

    /// Resume: paused sessions re-enter the queue at [`RESUME_PRIORITY`].
    pub async fn resume(&self, task_id: &str) -> Result<TaskRow> {
        let task = self.tasks.transition(task_id, "active").await?;
        for session in self.sessions.list_for_task(task_id).await? {
            if session.status == "paused" {
                self.sessions.transition(&session.id, "queued").await?;
                self.queue.reenqueue(&session.id, RESUME_PRIORITY).await?;
            }
        }
        Ok(task)
    }

    /// Stop: every non-terminal session is cancelled and the task mirrors it.
    /// Already-executing runners observe the status on their next report.
    pub async fn stop(&self, task_id: &str) -> Result<TaskRow> {
        let task = self.tasks.transition(task_id, "cancelled").await?;
        for session in self.sessions.list_for_task(task_id).await? {
            if !crate::model::is_terminal_session_status(&session.status) {
                self.sessions.transition(&session.id, "cancelled").await?;
                self.queue.release(&session.id).await?;
            }
        }
        self.tasks.refresh_aggregates(task_id).await?;
        Ok(task)
    }

    /// Called on every session terminal transition: refresh the owning task's
    /// aggregate and close it if every session is accounted for.
    pub async fn record_session_terminal(&self, session: &SessionRow) -> Result<()> {
        let Some(task_id) = session.task_id.as_deref() else {
            return Ok(());
        };
        self.tasks.refresh_aggregates(task_id).await?;
        if self.tasks.try_complete(task_id).await? {
            info!(task_id, "task completed");
        }
        Ok(())
    }

    /// Safety-net sweep over active tasks; completion detection is poll-based,
    /// so a missed inline recheck only delays closing, never loses it.
    pub async fn sweep_aggregates(&self) -> Result<usize> {
        let mut closed = 0;
        for task_id in self.tasks.active_ids().await? {
            self.tasks.refresh_aggregates(&task_id).await?;
            if self.tasks.try_complete(&task_id).await? {
                info!(task_id = %task_id, "task completed (sweep)");
                closed += 1;
            }
        }
        Ok(closed)
    }
}
