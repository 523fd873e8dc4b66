//! Runner health tracking.
//!
//! Runners report liveness with `POST /health`; liveness itself is derived at
//! read time from the heartbeat age, never stored. There is no explicit
//! deregistration — a runner that stops heartbeating ages out silently.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::model::{now_ms, RunnerRow};
use crate::storage::with_timeout;

/// One heartbeat payload, as reported by the runner itself.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub active_sessions: i64,
    #[serde(default)]
    pub total_executed: i64,
    #[serde(default)]
    pub total_failures: i64,
    #[serde(default)]
    pub uptime_seconds: i64,
}

/// A runner record joined with its derived liveness.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    #[serde(flatten)]
    pub runner: RunnerRow,
    pub online: bool,
    pub seconds_since_heartbeat: i64,
}

#[derive(Clone)]
pub struct RunnerRegistry {
    pool: SqlitePool,
}

impl RunnerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert one runner record, refreshing `last_heartbeat`.
    pub async fn heartbeat(&self, runner_id: &str, hb: &Heartbeat) -> Result<()> {
        let now = now_ms();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO runners \
                 (id, last_heartbeat, active_sessions, total_executed, total_failures, uptime_seconds, first_seen) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                   last_heartbeat = excluded.last_heartbeat, \
                   active_sessions = excluded.active_sessions, \
                   total_executed = excluded.total_executed, \
                   total_failures = excluded.total_failures, \
                   uptime_seconds = excluded.uptime_seconds",
            )
            .bind(runner_id)
            .bind(now)
            .bind(hb.active_sessions)
            .bind(hb.total_executed)
            .bind(hb.total_failures)
            .bind(hb.uptime_seconds)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, runner_id: &str) -> Result<Option<RunnerRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM runners WHERE id = ?")
                .bind(runner_id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    /// All runner records with derived online flags.
    pub async fn list(&self, freshness_window_secs: u64) -> Result<Vec<RunnerStatus>> {
        let rows: Vec<RunnerRow> = with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM runners ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?)
        })
        .await?;
        let now = now_ms();
        let window_ms = freshness_window_secs as i64 * 1000;
        Ok(rows
            .into_iter()
            .map(|runner| {
                let age_ms = now - runner.last_heartbeat;
                RunnerStatus {
                    online: age_ms < window_ms,
                    seconds_since_heartbeat: age_ms / 1000,
                    runner,
                }
            })
            .collect())
    }

    /// Fleet status for load decisions and UI display: `online` when every
    /// known runner is fresh, `degraded` when only some are, `offline` when
    /// none are (or none exist).
    pub async fn fleet_status(&self, freshness_window_secs: u64) -> Result<&'static str> {
        let runners = self.list(freshness_window_secs).await?;
        let online = runners.iter().filter(|r| r.online).count();
        Ok(if runners.is_empty() || online == 0 {
            "offline"
        } else if online == runners.len() {
            "online"
        } else {
            "degraded"
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn hb(active: i64) -> Heartbeat {
        Heartbeat {
            active_sessions: active,
            total_executed: 10,
            total_failures: 1,
            uptime_seconds: 3600,
        }
    }

    #[tokio::test]
    async fn heartbeat_upserts_and_derives_online() {
        let storage = Storage::in_memory().await.unwrap();
        let registry = RunnerRegistry::new(storage.pool());

        registry.heartbeat("r1", &hb(2)).await.unwrap();
        registry.heartbeat("r1", &hb(3)).await.unwrap();

        let runners = registry.list(60).await.unwrap();
        assert_eq!(runners.len(), 1);
        assert!(runners[0].online);
        assert_eq!(runners[0].runner.active_sessions, 3);
        assert_eq!(registry.fleet_status(60).await.unwrap(), "online");
    }

    #[tokio::test]
    async fn stale_heartbeat_reads_offline() {
        let storage = Storage::in_memory().await.unwrap();
        let registry = RunnerRegistry::new(storage.pool());
        registry.heartbeat("r1", &hb(0)).await.unwrap();

        // Age the heartbeat past the freshness window by hand.
        sqlx::query("UPDATE runners SET last_heartbeat = last_heartbeat - 120000 WHERE id = 'r1'")
            .execute(&storage.pool())
            .await
            .unwrap();

        let runners = registry.list(60).await.unwrap();
        assert!(!runners[0].online);
        assert_eq!(registry.fleet_status(60).await.unwrap(), "offline");

        // A second fresh runner makes the fleet degraded.
        registry.heartbeat("r2", &hb(1)).await.unwrap();
        assert_eq!(registry.fleet_status(60).await.unwrap(), "degraded");
    }

    #[tokio::test]
    async fn empty_fleet_is_offline() {
        let storage = Storage::in_memory().await.unwrap();
        let registry = RunnerRegistry::new(storage.pool());
        assert_eq!(registry.fleet_status(60).await.unwrap(), "offline");
    }
}
