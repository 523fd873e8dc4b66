//! Background jobs for the scheduler.
//! All jobs run on tokio intervals, spawned from `AppContext`.

use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::config::SharedSchedulerConfig;
use crate::model::now_ms;
use crate::scheduler::Scheduler;
use crate::sessions::SessionStore;
use crate::tasks::Orchestrator;

/// Stale-lease reaper: runs every 30s.
/// Sessions `running` whose runner stopped heartbeating for longer than
/// `lease_timeout_secs` are failed with a runner-lost error, which routes
/// them through the Retry Engine (transient failures re-queue while
/// retries remain).
/// `lease_timeout_secs = 0` disables reaping.
pub async fn run_lease_reaper(
    scheduler: Arc<Scheduler>,
    sessions: SessionStore,
    config: SharedSchedulerConfig,
) {
    let mut ticker = interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;

        let timeout_secs = config.read().await.lease_timeout_secs;
        if timeout_secs == 0 {
            continue;
        }
        let cutoff = now_ms() - (timeout_secs as i64 * 1000);

        let stale = match sessions.stale_running(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!("Lease reaper query error: {e}");
                continue;
            }
        };
        for session in stale {
            let error = format!(
                "runner {} lost (no heartbeat within {timeout_secs}s)",
                session.runner_id.as_deref().unwrap_or("unknown")
            );
            match scheduler.fail_session(&session.id, &error).await {
                Ok((_, decision)) => {
                    info!(session_id = %session.id, ?decision, "stale lease reclaimed");
                }
                Err(e) => warn!(session_id = %session.id, "Lease reaper error: {e}"),
            }
        }
    }
}

/// Aggregate sweeper: runs every 30s.
/// Completion detection is poll-based; the inline recheck on each terminal
/// transition normally closes tasks, this sweep catches anything missed
/// (e.g. a crash between the session write and the aggregate write).
pub async fn run_aggregate_sweeper(orchestrator: Orchestrator) {
    let mut ticker = interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;

        match orchestrator.sweep_aggregates().await {
            Ok(closed) if closed > 0 => info!("Aggregate sweep closed {closed} tasks"),
            Ok(_) => {}
            Err(e) => warn!("Aggregate sweeper error: {e}"),
        }
    }
}
