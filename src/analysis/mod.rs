//! Failure-analysis collaborator.
//!
//! Root-cause classification of failed sessions is delegated to an external
//! service; the scheduler only consumes the verdict fields that drive retry
//! and resume decisions. When the service is unconfigured or unreachable we
//! degrade to a static pattern-match over the error string and recent log
//! lines, marked `ai_powered: false` — analysis never fails a request.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AnalysisConfig;
use crate::model::{SessionLogRow, SessionRow};

/// Verdict consumed by the Retry Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureVerdict {
    /// Classified cause: timeout | network | captcha | selector | crash | unknown.
    pub failure_type: String,
    pub is_resumable: bool,
    /// Step index the next attempt should start from, when resumable.
    pub resume_from_step: Option<i64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub ai_powered: bool,
}

impl FailureVerdict {
    /// Transient causes are safe to re-queue without operator confirmation.
    pub fn is_transient(&self) -> bool {
        matches!(self.failure_type.as_str(), "timeout" | "network")
    }
}

#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    async fn analyze(&self, session: &SessionRow, logs: &[SessionLogRow]) -> FailureVerdict;
}

// ─── Heuristic fallback ──────────────────────────────────────────────────────

static TIMEOUT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)timed? ?out",
        r"(?i)deadline exceeded",
        r"(?i)no heartbeat",
        r"ERR_TIMED_OUT",
    ])
    .expect("timeout patterns compile")
});

static NETWORK_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)connection (refused|reset|closed)",
        r"(?i)dns|name not resolved",
        r"(?i)network",
        r"ERR_(CONNECTION|INTERNET|NAME|PROXY)",
    ])
    .expect("network patterns compile")
});

static CAPTCHA_PATTERNS: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new([r"(?i)captcha", r"(?i)challenge"]).expect("captcha patterns compile"));

static SELECTOR_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)selector",
        r"(?i)element not (found|visible|attached)",
        r"(?i)no node found",
    ])
    .expect("selector patterns compile")
});

/// Pattern-match the error string and log tail. Transient infrastructure
/// causes come back resumable from the session's recorded checkpoint.
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    fn classify(text: &str) -> (&'static str, bool) {
        if TIMEOUT_PATTERNS.is_match(text) {
            ("timeout", true)
        } else if NETWORK_PATTERNS.is_match(text) {
            ("network", true)
        } else if CAPTCHA_PATTERNS.is_match(text) {
            // Captcha walls reappear on retry; not worth an automatic one.
            ("captcha", false)
        } else if SELECTOR_PATTERNS.is_match(text) {
            // Page layout changed; restarting from step 0 sees the same page.
            ("selector", false)
        } else {
            ("unknown", false)
        }
    }
}

#[async_trait]
impl FailureAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, session: &SessionRow, logs: &[SessionLogRow]) -> FailureVerdict {
        let mut text = session.error.clone().unwrap_or_default();
        for log in logs.iter().rev().take(20) {
            if log.level == "error" || log.level == "warn" {
                text.push('\n');
                text.push_str(&log.message);
            }
        }
        let (failure_type, transient) = Self::classify(&text);
        let resumable = transient && session.is_resumable;
        FailureVerdict {
            failure_type: failure_type.to_string(),
            is_resumable: resumable,
            resume_from_step: if resumable {
                session.last_successful_step.map(|s| s + 1)
            } else {
                None
            },
            confidence: if failure_type == "unknown" { 0.2 } else { 0.6 },
            explanation: format!("pattern-matched as {failure_type}"),
            ai_powered: false,
        }
    }
}

// ─── HTTP analyzer ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    session: &'a SessionRow,
    logs: &'a [SessionLogRow],
}

/// Calls the configured analysis service, degrading to [`HeuristicAnalyzer`]
/// on any failure.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(config: &AnalysisConfig, endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs()))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        }
    }

    async fn call(&self, session: &SessionRow, logs: &[SessionLogRow]) -> Result<FailureVerdict> {
        let url = format!("{}/analyze", self.endpoint.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&AnalyzeRequest { session, logs });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.context("analysis request failed")?;
        let response = response
            .error_for_status()
            .context("analysis returned an error status")?;
        let mut verdict: FailureVerdict =
            response.json().await.context("decoding analysis response")?;
        verdict.ai_powered = true;
        Ok(verdict)
    }
}

#[async_trait]
impl FailureAnalyzer for HttpAnalyzer {
    async fn analyze(&self, session: &SessionRow, logs: &[SessionLogRow]) -> FailureVerdict {
        match self.call(session, logs).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(session_id = %session.id, "analysis unavailable, using heuristic: {e:#}");
                HeuristicAnalyzer.analyze(session, logs).await
            }
        }
    }
}

/// Pick the analyzer for the current config.
pub fn analyzer_for(config: &AnalysisConfig) -> Box<dyn FailureAnalyzer> {
    match &config.endpoint {
        Some(endpoint) => Box::new(HttpAnalyzer::new(config, endpoint.clone())),
        None => Box::new(HeuristicAnalyzer),
    }
}
