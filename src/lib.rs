//! flockd — fleet execution scheduler for browser-automation runners.
//!
//! The daemon owns the durable state (SQLite), the leased execution queue,
//! session lifecycle, retry policy, and task fan-out. Runners are dumb pollers:
//! they claim jobs over REST, execute them, and report back. Everything
//! interesting happens here.

pub mod analysis;
pub mod config;
pub mod model;
pub mod queue;
pub mod rest;
pub mod retry;
pub mod runners;
pub mod scenarios;
pub mod scheduler;
pub mod sessions;
pub mod storage;
pub mod tasks;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

use crate::analysis::analyzer_for;
use crate::config::{DaemonConfig, SharedSchedulerConfig};
use crate::queue::ExecutionQueue;
use crate::retry::RetryEngine;
use crate::runners::RunnerRegistry;
use crate::scenarios::compiler::{compiler_for, ScenarioCompiler};
use crate::scheduler::Scheduler;
use crate::sessions::SessionStore;
use crate::storage::Storage;
use crate::tasks::{Orchestrator, TaskStore};

/// Everything the REST handlers and background jobs share. All stores are
/// cheap clones over the same SQLite pool.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub scheduler_config: SharedSchedulerConfig,
    pub data_dir: PathBuf,
    pub storage: Storage,
    pub sessions: SessionStore,
    pub queue: ExecutionQueue,
    pub runners: RunnerRegistry,
    pub tasks: TaskStore,
    pub orchestrator: Orchestrator,
    pub scheduler: Arc<Scheduler>,
    pub retry: RetryEngine,
    pub compiler: Arc<dyn ScenarioCompiler>,
    pub daemon_id: String,
    pub started_at: Instant,
}

impl AppContext {
    pub async fn init(data_dir: &Path) -> Result<Arc<Self>> {
        let config = DaemonConfig::load_or_init(data_dir).await?;
        let storage = Storage::new(data_dir).await?;
        Ok(Self::from_parts(config, storage, data_dir.to_path_buf()))
    }

    /// In-memory context for tests. No config file touches the filesystem
    /// unless a test saves one explicitly.
    pub async fn in_memory(config: DaemonConfig) -> Result<Arc<Self>> {
        let storage = Storage::in_memory().await?;
        Ok(Self::from_parts(config, storage, std::env::temp_dir()))
    }

    /// Wire the full object graph over an already-open database.
    pub fn from_parts(config: DaemonConfig, storage: Storage, data_dir: PathBuf) -> Arc<Self> {
        let pool = storage.pool();
        let scheduler_config: SharedSchedulerConfig =
            Arc::new(RwLock::new(config.scheduler.clone()));

        let sessions = SessionStore::new(pool.clone());
        let queue = ExecutionQueue::new(pool.clone());
        let runners = RunnerRegistry::new(pool.clone());
        let tasks = TaskStore::new(pool.clone());
        let orchestrator = Orchestrator::new(
            tasks.clone(),
            sessions.clone(),
            queue.clone(),
            storage.clone(),
        );

        let analyzer: Arc<dyn analysis::FailureAnalyzer> =
            Arc::from(analyzer_for(&config.analysis));
        let retry = RetryEngine::new(
            scheduler_config.clone(),
            sessions.clone(),
            queue.clone(),
            storage.clone(),
            analyzer,
        );
        let scheduler = Arc::new(Scheduler::new(
            scheduler_config.clone(),
            storage.clone(),
            sessions.clone(),
            queue.clone(),
            retry.clone(),
            orchestrator.clone(),
        ));
        let compiler: Arc<dyn ScenarioCompiler> = Arc::from(compiler_for(&config.compiler));

        Arc::new(Self {
            config: Arc::new(config),
            scheduler_config,
            data_dir,
            storage,
            sessions,
            queue,
            runners,
            tasks,
            orchestrator,
            scheduler,
            retry,
            compiler,
            daemon_id: model::new_id(),
            started_at: Instant::now(),
        })
    }

    /// Spawn the periodic jobs: the stale-lease reaper and the task aggregate
    /// sweeper. Both run until the daemon exits.
    pub fn start_background_jobs(self: &Arc<Self>) {
        info!("starting background jobs");
        tokio::spawn(tasks::jobs::run_lease_reaper(
            self.scheduler.clone(),
            self.sessions.clone(),
            self.scheduler_config.clone(),
        ));
        tokio::spawn(tasks::jobs::run_aggregate_sweeper(self.orchestrator.clone()));
    }
}
