//! Scenario compiler collaborator.
//!
//! Turning a task's goal and behavior config into an ordered step list is
//! external to the scheduler. When a `[compiler]` endpoint is configured we
//! call it over HTTP; otherwise (or when the call fails) the built-in
//! template compiler fills a standard visit pattern from the task's entry
//! point. Compiled output is marked with `ai_powered` so consumers can tell
//! the two apart.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::CompilerConfig;
use crate::model::{BehaviorConfig, Step};

#[derive(Debug, Clone, Serialize)]
pub struct CompileRequest {
    pub goal: String,
    pub entry_url: Option<String>,
    pub search_query: Option<String>,
    pub behavior: BehaviorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompiledScenario {
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub ai_powered: bool,
}

#[async_trait]
pub trait ScenarioCompiler: Send + Sync {
    async fn compile(&self, request: &CompileRequest) -> Result<CompiledScenario>;
}

// ─── Template compiler (fallback) ────────────────────────────────────────────

/// Deterministic template filler: navigate (or search), dwell, scroll passes,
/// closing screenshot. Always available, never AI-powered.
pub struct TemplateCompiler;

#[async_trait]
impl ScenarioCompiler for TemplateCompiler {
    async fn compile(&self, request: &CompileRequest) -> Result<CompiledScenario> {
        let behavior = &request.behavior;
        let mut steps = Vec::new();

        let entry = match (&request.entry_url, &request.search_query) {
            (Some(url), _) => url.clone(),
            (None, Some(query)) => {
                let mut engine_url = String::from("https://www.google.com/search?q=");
                engine_url.push_str(&urlencoding::encode(query));
                engine_url
            }
            (None, None) => anyhow::bail!("task has neither an entry URL nor a search query"),
        };
        steps.push(Step::Navigate {
            url: entry,
            wait_until_loaded: true,
        });
        if request.search_query.is_some() && request.entry_url.is_none() {
            // Search entry: open the first organic result before dwelling.
            steps.push(Step::Click {
                selector: "#search a[href]".to_string(),
                description: Some("first organic result".to_string()),
            });
        }

        let dwell_total = dwell_seconds(behavior);
        let passes = behavior.scroll_passes.max(1);
        let per_pass_ms = (dwell_total * 1000) / passes as u64;
        let mut rng = rand::thread_rng();
        for _ in 0..passes {
            let amount = if behavior.randomize {
                rng.gen_range(400..=1200)
            } else {
                800
            };
            steps.push(Step::Scroll {
                amount,
                duration_ms: Some(1_500),
            });
            steps.push(Step::Wait {
                duration_ms: per_pass_ms.max(1_000),
            });
        }
        steps.push(Step::Screenshot {
            label: Some("final".to_string()),
        });

        Ok(CompiledScenario {
            name: template_name(&request.goal),
            steps,
            ai_powered: false,
        })
    }
}

fn dwell_seconds(behavior: &BehaviorConfig) -> u64 {
    let min = behavior.min_dwell_seconds.max(1);
    let max = behavior.max_dwell_seconds.max(min + 1);
    if behavior.randomize {
        rand::thread_rng().gen_range(min..max)
    } else {
        min
    }
}

fn template_name(goal: &str) -> String {
    let mut name = goal.trim().to_string();
    if name.len() > 60 {
        name.truncate(60);
    }
    if name.is_empty() {
        name = "generated scenario".to_string();
    }
    name
}

// ─── HTTP compiler ───────────────────────────────────────────────────────────

/// Calls the configured compiler service, degrading to [`TemplateCompiler`]
/// when the service is unreachable or returns garbage.
pub struct HttpCompiler {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCompiler {
    pub fn new(config: &CompilerConfig, endpoint: String) -> Self {
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
}

#[async_trait]
impl ScenarioCompiler for HttpCompiler {
    async fn compile(&self, request: &CompileRequest) -> Result<CompiledScenario> {
        let result = async {
            let url = format!("{}/compile", self.endpoint.trim_end_matches('/'));
            let mut req = self.client.post(&url).json(request);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            let response = req.send().await.context("compiler request failed")?;
            let response = response
                .error_for_status()
                .context("compiler returned an error status")?;
            let mut compiled: CompiledScenario =
                response.json().await.context("decoding compiler response")?;
            if compiled.steps.is_empty() {
                anyhow::bail!("compiler returned no steps");
            }
            compiled.ai_powered = true;
            Ok::<_, anyhow::Error>(compiled)
        }
        .await;

        match result {
            Ok(compiled) => Ok(compiled),
            Err(e) => {
                warn!("scenario compiler unavailable, using template: {e:#}");
                TemplateCompiler.compile(request).await
            }
        }
    }
}

/// Pick the compiler for the current config.
pub fn compiler_for(config: &CompilerConfig) -> Box<dyn ScenarioCompiler> {
    match &config.endpoint {
        Some(endpoint) => Box::new(HttpCompiler::new(config, endpoint.clone())),
        None => Box::new(TemplateCompiler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(entry_url: Option<&str>, query: Option<&str>) -> CompileRequest {
        CompileRequest {
            goal: "visit product page".to_string(),
            entry_url: entry_url.map(String::from),
            search_query: query.map(String::from),
            behavior: BehaviorConfig {
                randomize: false,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn template_builds_direct_visit() {
        let compiled = TemplateCompiler
            .compile(&request(Some("https://shop.example/item/1"), None))
            .await
            .unwrap();
        assert!(!compiled.ai_powered);
        assert!(matches!(compiled.steps[0], Step::Navigate { .. }));
        assert!(matches!(compiled.steps.last(), Some(Step::Screenshot { .. })));

        let report = crate::scenarios::validate_steps(
            &serde_json::to_value(&compiled.steps).unwrap(),
        );
        assert!(report.valid, "template output must validate: {:?}", report.errors);
    }

    #[tokio::test]
    async fn template_search_entry_clicks_a_result() {
        let compiled = TemplateCompiler
            .compile(&request(None, Some("rust async scheduler")))
            .await
            .unwrap();
        let clicks = compiled
            .steps
            .iter()
            .filter(|s| matches!(s, Step::Click { .. }))
            .count();
        assert_eq!(clicks, 1);
        match &compiled.steps[0] {
            Step::Navigate { url, .. } => assert!(url.contains("rust%20async%20scheduler")),
            other => panic!("expected navigate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn template_requires_an_entry_point() {
        assert!(TemplateCompiler.compile(&request(None, None)).await.is_err());
    }

    #[tokio::test]
    async fn http_compiler_degrades_to_template() {
        let config = CompilerConfig {
            endpoint: Some("http://127.0.0.1:1".to_string()),
            api_key: None,
            timeout_secs: Some(1),
        };
        let compiler = compiler_for(&config);
        let compiled = compiler
            .compile(&request(Some("https://example.com"), None))
            .await
            .unwrap();
        assert!(!compiled.ai_powered, "fallback output must not claim AI");
        assert!(!compiled.steps.is_empty());
    }
}
