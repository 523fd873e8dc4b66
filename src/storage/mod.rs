//! SQLite storage: pool setup, migrations, and the profile / scenario /
//! session-log operations that have no scheduling logic of their own.
//!
//! Sessions, the execution queue, tasks, and runner health each have their own
//! store type sharing this pool (see `sessions`, `queue`, `tasks`, `runners`).

use anyhow::{Context as _, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::{path::Path, str::FromStr};

use crate::model::{new_id, now_ms, ProfileRow, ScenarioRow, SessionLogRow};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
pub(crate) async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// One log entry submitted by a runner. `POST /logs` accepts one or many.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LogEntryInput {
    pub session_id: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub step_index: Option<i64>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("flockd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single pooled connection keeps the
    /// schema alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    /// Used to create the session/queue/task stores over the same database.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("src/storage/migrations")
            .run(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Cheap liveness probe for the self-health endpoint.
    pub async fn db_ok(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // ─── Profiles ────────────────────────────────────────────────────────────

    pub async fn create_profile(
        &self,
        name: &str,
        proxy: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<ProfileRow> {
        let id = new_id();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO profiles (id, name, proxy, fingerprint, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(name)
            .bind(proxy)
            .bind(fingerprint)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.get_profile(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("profile {id} vanished after insert"))
    }

    pub async fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM profiles WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM profiles ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Overwrite the profile's persisted browser state (cookies/localStorage),
    /// uploaded by runners mid-session.
    pub async fn update_profile_state(&self, id: &str, storage_state: &str) -> Result<bool> {
        with_timeout(async {
            let n = sqlx::query("UPDATE profiles SET storage_state = ?, last_active = ? WHERE id = ?")
                .bind(storage_state)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(n > 0)
        })
        .await
    }

    /// Bump the profile's run counter on session success.
    pub async fn record_profile_run(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "UPDATE profiles SET sessions_run = sessions_run + 1, last_active = ? WHERE id = ?",
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    // ─── Scenarios ───────────────────────────────────────────────────────────

    pub async fn insert_scenario(
        &self,
        name: &str,
        steps_json: &str,
        step_count: i64,
        estimated_duration_seconds: i64,
        valid: bool,
        generated: bool,
    ) -> Result<ScenarioRow> {
        let id = new_id();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO scenarios \
                 (id, name, schema_version, steps, step_count, estimated_duration_seconds, valid, generated, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(name)
            .bind(crate::model::STEP_SCHEMA_VERSION)
            .bind(steps_json)
            .bind(step_count)
            .bind(estimated_duration_seconds)
            .bind(valid)
            .bind(generated)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.get_scenario(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("scenario {id} vanished after insert"))
    }

    pub async fn get_scenario(&self, id: &str) -> Result<Option<ScenarioRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM scenarios WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn mark_scenario_valid(&self, id: &str, valid: bool) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE scenarios SET valid = ? WHERE id = ?")
                .bind(valid)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    // ─── Session logs ────────────────────────────────────────────────────────

    /// Append one log entry. Write-once: entries are never updated or deleted.
    pub async fn append_log(&self, entry: &LogEntryInput) -> Result<SessionLogRow> {
        let id = new_id();
        let details = entry
            .details
            .as_ref()
            .map(|v| v.to_string());
        with_timeout(async {
            sqlx::query(
                "INSERT INTO session_logs (id, session_id, ts, level, message, step_index, action, details) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&entry.session_id)
            .bind(now_ms())
            .bind(&entry.level)
            .bind(&entry.message)
            .bind(entry.step_index)
            .bind(&entry.action)
            .bind(&details)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM session_logs WHERE id = ?")
                .bind(&id)
                .fetch_one(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn list_logs(&self, session_id: &str, limit: i64) -> Result<Vec<SessionLogRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM session_logs WHERE session_id = ? ORDER BY ts ASC, id ASC LIMIT ?",
            )
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }
}
