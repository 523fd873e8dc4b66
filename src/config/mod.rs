//! Daemon configuration (`config.toml` in the data directory).
//!
//! Each section is a `#[serde(default)]` struct so a partial file is always
//! valid. The `[scheduler]` section is the live scheduling policy: it is held
//! behind an `RwLock` and re-read on every claim attempt, so edits (via
//! `PUT /config/scheduler` or a file reload) take effect on the next poll
//! cycle — there is no versioning or coupling to in-flight leases.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_PORT: u16 = 4610;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── SchedulerConfig ─────────────────────────────────────────────────────────

/// Global scheduling parameters (`[scheduler]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent `running` sessions per runner identity.
    pub max_concurrency: u32,
    /// Lower bound on the advisory start delay handed to runners, ms.
    pub min_delay_ms: u64,
    /// Upper bound (exclusive) on the randomized start delay, ms.
    pub max_delay_ms: u64,
    /// Sample the delay uniformly in [min_delay_ms, max_delay_ms) when true;
    /// otherwise always hand out min_delay_ms.
    pub randomize_delays: bool,
    /// Maximum automatic re-queues per session.
    pub max_retries: u32,
    /// Re-queue failed sessions at all.
    pub retry_on_failure: bool,
    /// Master switch: when false every claim attempt reports no work.
    pub active: bool,
    /// Seconds a `running` session may outlive its runner's last heartbeat
    /// before the reaper reclaims it. 0 disables reaping.
    pub lease_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            min_delay_ms: 2_000,
            max_delay_ms: 30_000,
            randomize_delays: true,
            max_retries: 2,
            retry_on_failure: true,
            active: true,
            lease_timeout_secs: 300,
        }
    }
}

pub type SharedSchedulerConfig = Arc<RwLock<SchedulerConfig>>;

// ─── HealthConfig ────────────────────────────────────────────────────────────

/// Runner liveness configuration (`[health]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// A runner is online while its last heartbeat is younger than this.
    pub freshness_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 60,
        }
    }
}

// ─── AnalysisConfig ──────────────────────────────────────────────────────────

/// External failure-analysis collaborator (`[analysis]` in config.toml).
///
/// Unset endpoint means the static heuristic fallback is always used and
/// verdicts carry `ai_powered: false`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Base URL of the analysis service, e.g. `"http://127.0.0.1:9810"`.
    pub endpoint: Option<String>,
    /// Bearer token sent with analysis requests.
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl AnalysisConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(15)
    }
}

// ─── CompilerConfig ──────────────────────────────────────────────────────────

/// External scenario-compiler collaborator (`[compiler]` in config.toml).
///
/// Unset endpoint means scenarios are produced by the built-in template
/// compiler instead.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl CompilerConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// REST server port.
    pub port: u16,
    /// Bind address (use 0.0.0.0 to accept runners from the LAN).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub analysis: AnalysisConfig,
    pub compiler: CompilerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: default_bind_address(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            analysis: AnalysisConfig::default(),
            compiler: CompilerConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.toml")
    }

    /// Load `config.toml` from the data dir, writing a default file on first
    /// run so operators have something to edit.
    pub async fn load_or_init(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = Self::path(data_dir);
        if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self =
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(data_dir).await?;
            info!("wrote default config to {}", path.display());
            Ok(config)
        }
    }

    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = Self::path(data_dir);
        let raw = toml::to_string_pretty(self).context("serializing config")?;
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_delay_ms < self.scheduler.min_delay_ms {
            anyhow::bail!(
                "scheduler.max_delay_ms ({}) must be >= scheduler.min_delay_ms ({})",
                self.scheduler.max_delay_ms,
                self.scheduler.min_delay_ms
            );
        }
        if self.health.freshness_window_secs == 0 {
            anyhow::bail!("health.freshness_window_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            port = 9000
            [scheduler]
            max_concurrency = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.scheduler.max_concurrency, 1);
        assert!(config.scheduler.retry_on_failure);
        assert_eq!(config.health.freshness_window_secs, 60);
    }

    #[test]
    fn delay_bounds_are_validated() {
        let mut config = DaemonConfig::default();
        config.scheduler.min_delay_ms = 5_000;
        config.scheduler.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn first_run_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_or_init(dir.path()).await.unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(DaemonConfig::path(dir.path()).exists());

        let again = DaemonConfig::load_or_init(dir.path()).await.unwrap();
        assert_eq!(again.scheduler, config.scheduler);
    }
}
