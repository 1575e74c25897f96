// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! History summarization: compresses the transcript's latest plan/delivery/
//! review into a deterministic, size-bounded block for the next prompt.
//!
//! Grounded on §4.7.1 of the design: per-field truncation, per-list caps,
//! an optional `KEY_CHANGES` digest, and an overall character cap.

use roundtable_config::HistoryConfig;
use serde_json::Value;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut truncated: String = s.chars().take(max).collect();
        truncated.push('…');
        truncated
    }
}

fn truncate_list<'a>(items: impl Iterator<Item = &'a Value>, limit: usize) -> Vec<&'a Value> {
    items.take(limit).collect()
}

/// One turn's worth of summarized state, keyed by role.
#[derive(Debug, Default)]
pub struct LatestByRole {
    pub plan: Option<Value>,
    pub delivery: Option<Value>,
    pub review: Option<Value>,
}

fn render_plan(plan: &Value, cfg: &HistoryConfig) -> String {
    let scope = plan.get("implementation_scope").and_then(Value::as_str).unwrap_or("");
    let criteria: Vec<String> = plan
        .get("acceptance_criteria")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();
    format!(
        "LATEST PLAN:\n  scope: {}\n  acceptance_criteria: {}",
        truncate_chars(scope, cfg.field_max_chars),
        criteria.join("; ")
    )
}

fn render_delivery(delivery: &Value, cfg: &HistoryConfig) -> String {
    let understanding = delivery.get("task_understanding").and_then(Value::as_str).unwrap_or("");
    let empty = Vec::new();
    let evidence = delivery.get("execution_evidence").and_then(Value::as_array).unwrap_or(&empty);
    let evidence_lines: Vec<String> = truncate_list(evidence.iter(), cfg.evidence_limit)
        .iter()
        .filter_map(|e| {
            let cmd = e.get("command")?.as_str()?;
            let result = e.get("result")?.as_str()?;
            Some(format!("{} => {}", truncate_chars(cmd, cfg.field_max_chars), truncate_chars(result, cfg.field_max_chars)))
        })
        .collect();
    format!(
        "LATEST DELIVERY:\n  understanding: {}\n  evidence:\n    {}",
        truncate_chars(understanding, cfg.field_max_chars),
        evidence_lines.join("\n    ")
    )
}

fn render_review(review: &Value, cfg: &HistoryConfig) -> String {
    let acceptance = review.get("acceptance").and_then(Value::as_str).unwrap_or("");
    let empty = Vec::new();
    let issues = review.get("issues").and_then(Value::as_array).unwrap_or(&empty);
    let issue_lines: Vec<String> = truncate_list(issues.iter(), cfg.issue_limit)
        .iter()
        .filter_map(|i| {
            let sev = i.get("severity")?.as_str()?;
            let summary = i.get("summary")?.as_str()?;
            Some(format!("[{sev}]: {}", truncate_chars(summary, cfg.field_max_chars)))
        })
        .collect();
    let root_cause = review.get("root_cause").and_then(Value::as_array).unwrap_or(&empty);
    let root_cause_lines: Vec<String> = truncate_list(root_cause.iter(), cfg.root_cause_limit)
        .iter()
        .filter_map(|s| s.as_str())
        .map(|s| truncate_chars(s, cfg.field_max_chars))
        .collect();
    format!(
        "LATEST REVIEW:\n  acceptance: {}\n  issues:\n    {}\n  root_cause:\n    {}",
        acceptance,
        issue_lines.join("\n    "),
        root_cause_lines.join("\n    ")
    )
}

fn render_key_changes(latest: &LatestByRole, cfg: &HistoryConfig) -> Option<String> {
    if !cfg.include_key_changes {
        return None;
    }
    let mut lines = Vec::new();
    if let Some(plan) = &latest.plan {
        if let Some(criteria) = plan.get("acceptance_criteria").and_then(Value::as_array) {
            for c in criteria.iter().filter_map(Value::as_str) {
                lines.push(format!("criterion: {}", truncate_chars(c, cfg.field_max_chars)));
            }
        }
    }
    if let Some(delivery) = &latest.delivery {
        if let Some(evidence) = delivery.get("execution_evidence").and_then(Value::as_array) {
            for e in truncate_list(evidence.iter(), cfg.evidence_limit) {
                if let (Some(cmd), Some(result)) = (e.get("command").and_then(Value::as_str), e.get("result").and_then(Value::as_str)) {
                    lines.push(format!("{cmd} => {result}"));
                }
            }
        }
        if let Some(deliverables) = delivery.get("deliverables").and_then(Value::as_array) {
            for d in deliverables {
                if let Some(path) = d.get("path").and_then(Value::as_str) {
                    lines.push(format!("new deliverable: {path}"));
                }
            }
        }
    }
    if let Some(review) = &latest.review {
        if let Some(issues) = review.get("issues").and_then(Value::as_array) {
            for i in truncate_list(issues.iter(), cfg.issue_limit) {
                if let (Some(sev), Some(summary)) = (i.get("severity").and_then(Value::as_str), i.get("summary").and_then(Value::as_str)) {
                    lines.push(format!("[{sev}]: {summary}"));
                }
            }
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(format!("KEY_CHANGES:\n  {}", lines.join("\n  ")))
    }
}

/// Renders the bounded history block for the next prompt.
pub fn summarize(latest: &LatestByRole, cfg: &HistoryConfig) -> String {
    let mut sections = Vec::new();
    if let Some(plan) = &latest.plan {
        sections.push(render_plan(plan, cfg));
    }
    if let Some(delivery) = &latest.delivery {
        sections.push(render_delivery(delivery, cfg));
    }
    if let Some(review) = &latest.review {
        sections.push(render_review(review, cfg));
    }
    if let Some(key_changes) = render_key_changes(latest, cfg) {
        sections.push(key_changes);
    }

    let joined = sections.join("\n\n");
    truncate_chars(&joined, cfg.max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> HistoryConfig {
        HistoryConfig {
            max_chars: 6000,
            field_max_chars: 800,
            evidence_limit: 8,
            issue_limit: 8,
            root_cause_limit: 5,
            include_key_changes: true,
        }
    }

    #[test]
    fn empty_history_renders_empty_string() {
        let latest = LatestByRole::default();
        assert_eq!(summarize(&latest, &cfg()), "");
    }

    #[test]
    fn plan_and_review_sections_both_appear() {
        let latest = LatestByRole {
            plan: Some(json!({"implementation_scope": "build x", "acceptance_criteria": ["works"]})),
            delivery: None,
            review: Some(json!({"acceptance": "pass", "issues": [], "root_cause": []})),
        };
        let text = summarize(&latest, &cfg());
        assert!(text.contains("LATEST PLAN"));
        assert!(text.contains("LATEST REVIEW"));
    }

    #[test]
    fn overall_cap_truncates_joined_text() {
        let long = "x".repeat(10_000);
        let latest = LatestByRole {
            plan: Some(json!({"implementation_scope": long, "acceptance_criteria": []})),
            delivery: None,
            review: None,
        };
        let mut small = cfg();
        small.max_chars = 50;
        let text = summarize(&latest, &small);
        assert!(text.chars().count() <= 51);
    }

    #[test]
    fn key_changes_includes_new_deliverables() {
        let latest = LatestByRole {
            plan: None,
            delivery: Some(json!({
                "execution_evidence": [],
                "deliverables": [{"path": "out.txt", "kind": "file", "summary": "s"}]
            })),
            review: None,
        };
        let text = summarize(&latest, &cfg());
        assert!(text.contains("new deliverable: out.txt"));
    }
}
