//! Durable execution queue: priority-ordered, leased by runner identity.
//!
//! The claim is the one operation in the system that must be atomic. It is a
//! single conditional UPDATE whose `rows_affected` decides the race: of N
//! concurrent claims on the same entry exactly one observes `claimed_by IS
//! NULL` and wins; the losers fall through to the next candidate.

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;

use crate::model::{now_ms, QueueEntryRow};
use crate::storage::with_timeout;

/// Candidates fetched per claim cycle before reporting no work.
const CLAIM_BATCH: i64 = 10;

#[derive(Clone)]
pub struct ExecutionQueue {
    pool: SqlitePool,
}

impl ExecutionQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an unclaimed entry for a session. Fails if the session already
    /// has an outstanding entry (at most one per session, by primary key).
    pub async fn enqueue(&self, session_id: &str, priority: i64) -> Result<QueueEntryRow> {
        with_timeout(async {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO queue_entries (session_id, priority, created_at) \
                 VALUES (?, ?, ?)",
            )
            .bind(session_id)
            .bind(priority)
            .bind(now_ms())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if inserted == 0 {
                return Err(anyhow!("session {session_id} already has a queue entry"));
            }
            Ok(())
        })
        .await?;
        self.entry(session_id)
            .await?
            .ok_or_else(|| anyhow!("queue entry for {session_id} vanished after insert"))
    }

    /// Re-enter the queue for a paused-then-resumed or retried session,
    /// clearing any stale claim fields. Idempotent over an existing entry.
    pub async fn reenqueue(&self, session_id: &str, priority: i64) -> Result<QueueEntryRow> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO queue_entries (session_id, priority, created_at) VALUES (?, ?, ?) \
                 ON CONFLICT(session_id) DO UPDATE \
                 SET priority = excluded.priority, created_at = excluded.created_at, \
                     claimed_by = NULL, claimed_at = NULL",
            )
            .bind(session_id)
            .bind(priority)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.entry(session_id)
            .await?
            .ok_or_else(|| anyhow!("queue entry for {session_id} vanished after upsert"))
    }

    /// Atomically claim one specific entry. Returns false if another runner
    /// got there first (or the entry is gone) — the caller moves on.
    pub async fn try_claim(&self, session_id: &str, runner_id: &str) -> Result<bool> {
        with_timeout(async {
            let n = sqlx::query(
                "UPDATE queue_entries SET claimed_by = ?, claimed_at = ? \
                 WHERE session_id = ? AND claimed_by IS NULL",
            )
            .bind(runner_id)
            .bind(now_ms())
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n == 1)
        })
        .await
    }

    /// Claim the highest-priority, oldest unclaimed entry for `runner_id`.
    ///
    /// Fetches a small candidate batch in queue order and races the
    /// conditional update against each; `Ok(None)` means no work.
    pub async fn claim_next(&self, runner_id: &str) -> Result<Option<QueueEntryRow>> {
        let candidates: Vec<QueueEntryRow> = with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM queue_entries WHERE claimed_by IS NULL \
                 ORDER BY priority DESC, created_at ASC, session_id ASC LIMIT ?",
            )
            .bind(CLAIM_BATCH)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        for candidate in candidates {
            if self.try_claim(&candidate.session_id, runner_id).await? {
                return self.entry(&candidate.session_id).await;
            }
        }
        Ok(None)
    }

    /// Undo a claim without removing the entry, making it claimable again.
    /// Used when the winning runner cannot start the session after all.
    pub async fn unclaim(&self, session_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "UPDATE queue_entries SET claimed_by = NULL, claimed_at = NULL WHERE session_id = ?",
            )
            .bind(session_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Remove the entry. Called when its session reaches a terminal status
    /// (or is paused out of the queue). Idempotent.
    pub async fn release(&self, session_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM queue_entries WHERE session_id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn entry(&self, session_id: &str) -> Result<Option<QueueEntryRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM queue_entries WHERE session_id = ?")
                    .bind(session_id)
                    .fetch_optional(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Pending (unclaimed) entry count, for the debug/overview endpoints.
    pub async fn depth(&self) -> Result<i64> {
        with_timeout(async {
            let (n,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM queue_entries WHERE claimed_by IS NULL")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(n)
        })
        .await
    }

    /// Full queue view in claim order, for the overview endpoint.
    pub async fn list(&self) -> Result<Vec<QueueEntryRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM queue_entries ORDER BY priority DESC, created_at ASC, session_id ASC",
            )
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }
}
