//! Core data model types shared across storage, scheduler, and REST layers.

use serde::{Deserialize, Serialize};

/// Generate a new ULID string.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Current time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileRow {
    pub id: String,
    pub name: String,
    pub proxy: Option<String>,
    pub fingerprint: Option<String>,   // JSON
    pub storage_state: Option<String>, // JSON (cookies + localStorage)
    pub sessions_run: i64,
    pub last_active: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScenarioRow {
    pub id: String,
    pub name: String,
    pub schema_version: i64,
    pub steps: String, // JSON array of tagged step variants
    pub step_count: i64,
    pub estimated_duration_seconds: i64,
    pub valid: bool,
    /// True when produced by the scenario compiler rather than authored by hand.
    pub generated: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub goal: String,
    pub entry_url: Option<String>,
    pub search_query: Option<String>,
    pub profile_ids: String, // JSON array of profile ids
    pub run_count: i64,
    pub behavior_config: Option<String>, // JSON
    pub scenario_id: Option<String>,
    pub status: String,
    pub sessions_created: i64,
    pub sessions_completed: i64,
    pub sessions_failed: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TaskRow {
    /// Decode the JSON `profile_ids` column.
    pub fn profile_id_list(&self) -> Vec<String> {
        serde_json::from_str(&self.profile_ids).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub profile_id: String,
    pub scenario_id: String,
    pub task_id: Option<String>,
    pub status: String,
    pub progress: i64,
    pub current_step: i64,
    pub total_steps: i64,
    pub runner_id: Option<String>,
    pub error: Option<String>,
    pub captcha_status: String,
    pub captcha_detected_at: Option<i64>,
    pub captcha_resolved_at: Option<i64>,
    pub is_resumable: bool,
    pub last_successful_step: Option<i64>,
    pub retry_count: i64,
    pub current_url: Option<String>,
    pub last_screenshot: Option<String>,
    pub metadata: Option<String>, // JSON
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub execution_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueEntryRow {
    pub session_id: String,
    pub priority: i64,
    pub created_at: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnerRow {
    pub id: String,
    pub last_heartbeat: i64,
    pub active_sessions: i64,
    pub total_executed: i64,
    pub total_failures: i64,
    pub uptime_seconds: i64,
    pub first_seen: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionLogRow {
    pub id: String,
    pub session_id: String,
    pub ts: i64,
    pub level: String,
    pub message: String,
    pub step_index: Option<i64>,
    pub action: Option<String>,
    pub details: Option<String>, // JSON
}

// ─── Session lifecycle ───────────────────────────────────────────────────────

/// Valid session status transitions.
///
/// Terminal statuses (success, error, cancelled) admit no transitions at all;
/// the Retry Engine's error → queued re-queue is a separate conditional
/// update, deliberately not representable here.
pub fn valid_session_transition(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        ("queued", "running")
            | ("queued", "paused")
            | ("queued", "cancelled")
            | ("running", "success")
            | ("running", "error")
            | ("running", "paused")
            | ("running", "cancelled")
            | ("paused", "queued")
            | ("paused", "cancelled")
    )
}

pub fn is_terminal_session_status(status: &str) -> bool {
    matches!(status, "success" | "error" | "cancelled")
}

pub fn is_valid_captcha_status(status: &str) -> bool {
    matches!(status, "none" | "detected" | "solving" | "solved" | "failed")
}

/// Valid task status transitions.
pub fn valid_task_transition(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        ("draft", "active")
            | ("draft", "cancelled")
            | ("active", "paused")
            | ("active", "completed")
            | ("active", "cancelled")
            | ("paused", "active")
            | ("paused", "cancelled")
    )
}

// ─── Scenario steps ──────────────────────────────────────────────────────────

/// One automation step. The scheduler treats the list as opaque beyond count
/// and duration; the variants exist so authored and compiled scenarios are
/// validated against a schema instead of passed through as untyped maps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until_loaded: bool,
    },
    Click {
        selector: String,
        #[serde(default)]
        description: Option<String>,
    },
    Scroll {
        /// Pixels; negative scrolls up.
        amount: i64,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    Type {
        selector: String,
        text: String,
        #[serde(default)]
        per_key_delay_ms: Option<u64>,
    },
    Wait {
        duration_ms: u64,
    },
    Screenshot {
        #[serde(default)]
        label: Option<String>,
    },
}

impl Step {
    /// Rough wall-clock estimate for one step, in seconds.
    pub fn estimated_seconds(&self) -> u64 {
        match self {
            Step::Navigate { .. } => 5,
            Step::Click { .. } => 2,
            Step::Scroll { duration_ms, .. } => duration_ms.map(|d| d / 1000).unwrap_or(3).max(1),
            Step::Type { text, .. } => (text.len() as u64 / 8).max(2),
            Step::Wait { duration_ms } => (duration_ms / 1000).max(1),
            Step::Screenshot { .. } => 1,
        }
    }
}

/// Current scenario step schema version. Bump when a variant changes shape.
pub const STEP_SCHEMA_VERSION: i64 = 1;

// ─── Task behavior config ────────────────────────────────────────────────────

/// Per-task behavior knobs consumed by the scenario compiler and runners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Minimum dwell time on the target page, seconds.
    pub min_dwell_seconds: u64,
    /// Maximum dwell time on the target page, seconds.
    pub max_dwell_seconds: u64,
    /// Number of scroll passes per visit.
    pub scroll_passes: u32,
    /// Randomize scroll distances and dwell within bounds.
    pub randomize: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            min_dwell_seconds: 10,
            max_dwell_seconds: 45,
            scroll_passes: 3,
            randomize: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        for from in ["success", "error", "cancelled"] {
            for to in ["queued", "running", "paused", "success", "error", "cancelled"] {
                assert!(
                    !valid_session_transition(from, to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn running_reaches_terminals() {
        assert!(valid_session_transition("running", "success"));
        assert!(valid_session_transition("running", "error"));
        assert!(valid_session_transition("running", "cancelled"));
        assert!(!valid_session_transition("queued", "success"));
        assert!(!valid_session_transition("paused", "running"));
    }

    #[test]
    fn step_round_trips_as_tagged_json() {
        let step = Step::Type {
            selector: "#search".into(),
            text: "rust scheduler".into(),
            per_key_delay_ms: Some(80),
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"type\":\"type\""));
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }
}
