//! Scenario step validation.
//!
//! Steps are schema-versioned tagged variants (see [`crate::model::Step`]);
//! anything that fails to decode, or decodes into a semantically broken step,
//! is reported per-index so authors can fix the exact entry. The scheduler
//! itself only ever consumes the step count and the duration estimate.

pub mod compiler;

use serde::Serialize;

use crate::model::Step;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub estimated_duration_seconds: u64,
}

/// Decode a raw steps array and dry-run per-variant field checks.
pub fn validate_steps(raw: &serde_json::Value) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut estimated = 0u64;

    let Some(items) = raw.as_array() else {
        return ValidationReport {
            valid: false,
            errors: vec!["steps must be a JSON array".to_string()],
            warnings,
            estimated_duration_seconds: 0,
        };
    };
    if items.is_empty() {
        errors.push("scenario has no steps".to_string());
    }

    let mut has_navigate = false;
    for (index, item) in items.iter().enumerate() {
        match serde_json::from_value::<Step>(item.clone()) {
            Ok(step) => {
                estimated += step.estimated_seconds();
                check_step(index, &step, &mut errors, &mut warnings);
                if matches!(step, Step::Navigate { .. }) {
                    has_navigate = true;
                }
            }
            Err(e) => errors.push(format!("step {index}: {e}")),
        }
    }
    if !items.is_empty() && !has_navigate {
        warnings.push("scenario never navigates anywhere".to_string());
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
        estimated_duration_seconds: estimated,
    }
}

fn check_step(index: usize, step: &Step, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    match step {
        Step::Navigate { url, .. } => {
            if url.trim().is_empty() {
                errors.push(format!("step {index}: navigate url is empty"));
            } else if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("step {index}: navigate url must be http(s), got {url:?}"));
            }
        }
        Step::Click { selector, .. } | Step::Type { selector, .. } => {
            if selector.trim().is_empty() {
                errors.push(format!("step {index}: selector is empty"));
            }
        }
        Step::Scroll { amount, .. } => {
            if *amount == 0 {
                warnings.push(format!("step {index}: scroll amount is 0 (no-op)"));
            }
        }
        Step::Wait { duration_ms } => {
            if *duration_ms == 0 {
                warnings.push(format!("step {index}: wait of 0ms (no-op)"));
            } else if *duration_ms > 120_000 {
                warnings.push(format!(
                    "step {index}: wait of {duration_ms}ms looks excessive"
                ));
            }
        }
        Step::Screenshot { .. } => {}
    }
    if let Step::Type { text, .. } = step {
        if text.is_empty() {
            warnings.push(format!("step {index}: typing empty text"));
        }
    }
}

/// Serialize steps plus derived columns (count, duration) for storage.
pub fn encode_steps(steps: &[Step]) -> (String, i64, i64) {
    let json = serde_json::to_string(steps).unwrap_or_else(|_| "[]".to_string());
    let estimated: u64 = steps.iter().map(Step::estimated_seconds).sum();
    (json, steps.len() as i64, estimated as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_scenario_passes_with_duration() {
        let steps = json!([
            {"type": "navigate", "url": "https://example.com"},
            {"type": "wait", "duration_ms": 2000},
            {"type": "scroll", "amount": 800},
            {"type": "click", "selector": "#buy"},
        ]);
        let report = validate_steps(&steps);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.estimated_duration_seconds >= 8);
    }

    #[test]
    fn broken_steps_are_reported_per_index() {
        let steps = json!([
            {"type": "navigate", "url": "ftp://example.com"},
            {"type": "click", "selector": "  "},
            {"type": "teleport"},
        ]);
        let report = validate_steps(&steps);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].contains("step 0"));
        assert!(report.errors[1].contains("step 1"));
        assert!(report.errors[2].contains("step 2"));
    }

    #[test]
    fn empty_and_nonarray_inputs_fail() {
        assert!(!validate_steps(&json!([])).valid);
        assert!(!validate_steps(&json!({"steps": []})).valid);
    }

    #[test]
    fn noop_waits_warn_but_pass() {
        let steps = json!([
            {"type": "navigate", "url": "https://example.com"},
            {"type": "wait", "duration_ms": 0},
        ]);
        let report = validate_steps(&steps);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }
}
