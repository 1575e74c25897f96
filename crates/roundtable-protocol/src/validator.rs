// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Structural and semantic validation of agent-produced JSON payloads.
//!
//! Purely in-memory: no filesystem access happens here (that is the safety
//! gate's job, layered on top by the orchestrator once a payload validates).

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{
    ALLOWED_ACCEPTANCE, ALLOWED_DELIVERABLE_KIND, ALLOWED_GATE_DECISION, ALLOWED_SEVERITY,
    ALLOWED_STATUS, DELIVERY_SCHEMA_VERSION, PLAN_SCHEMA_VERSION, REVIEW_SCHEMA_VERSION,
};

/// Which role-specific shape a reply is being checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Plan,
    Delivery,
    Review,
}

impl PayloadKind {
    pub fn expected_schema_version(&self) -> &'static str {
        match self {
            PayloadKind::Plan => PLAN_SCHEMA_VERSION,
            PayloadKind::Delivery => DELIVERY_SCHEMA_VERSION,
            PayloadKind::Review => REVIEW_SCHEMA_VERSION,
        }
    }

    fn expected_keys(&self) -> &'static [&'static str] {
        match self {
            PayloadKind::Plan => &[
                "schema_version",
                "status",
                "requirement_breakdown",
                "implementation_scope",
                "acceptance_criteria",
                "handoff_notes",
                "warnings",
                "errors",
                "next_question",
            ],
            PayloadKind::Delivery => &[
                "schema_version",
                "status",
                "task_understanding",
                "implementation_plan",
                "execution_evidence",
                "risks_and_rollback",
                "deliverables",
                "warnings",
                "errors",
                "next_question",
            ],
            PayloadKind::Review => &[
                "schema_version",
                "status",
                "acceptance",
                "verification",
                "root_cause",
                "issues",
                "gate",
                "next_question",
                "warnings",
                "errors",
            ],
        }
    }
}

/// One diagnostic, tagged with a stable machine-readable code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl ValidationError {
    /// Public so downstream crates (the safety gate) can report errors
    /// using the same taxonomy type without duplicating it.
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        ValidationError { code, message: message.into() }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolValidationResult {
    pub ok: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub parsed_content: Option<Value>,
}

impl ProtocolValidationResult {
    fn failure(errors: Vec<ValidationError>) -> Self {
        ProtocolValidationResult { ok: false, errors, warnings: Vec::new(), parsed_content: None }
    }
}

fn contains_question_mark(s: &str) -> bool {
    s.contains('?') || s.contains('？')
}

fn as_str_array<'a>(value: &'a Value, field: &str, errors: &mut Vec<ValidationError>) -> Vec<&'a str> {
    match value.as_array() {
        Some(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s),
                    None => errors.push(ValidationError::new(
                        "E_SCHEMA_INVALID_FORMAT",
                        format!("{field} must be an array of strings"),
                    )),
                }
            }
            out
        }
        None => {
            errors.push(ValidationError::new("E_SCHEMA_INVALID_FORMAT", format!("{field} must be an array")));
            Vec::new()
        }
    }
}

/// Validates the top-level shape shared by all three payload kinds and
/// returns the object's field map for role-specific checks, or `None` if
/// the reply isn't even a JSON object.
fn check_common<'a>(
    kind: PayloadKind,
    value: &'a Value,
    errors: &mut Vec<ValidationError>,
) -> Option<&'a Map<String, Value>> {
    let Some(obj) = value.as_object() else {
        errors.push(ValidationError::new("E_SCHEMA_INVALID_FORMAT", "reply is not a JSON object"));
        return None;
    };

    let expected: BTreeSet<&str> = kind.expected_keys().iter().copied().collect();
    let present: BTreeSet<&str> = obj.keys().map(String::as_str).collect();

    for missing in expected.difference(&present) {
        errors.push(ValidationError::new("E_SCHEMA_MISSING_FIELD", format!("missing field: {missing}")));
    }
    for unexpected in present.difference(&expected) {
        errors.push(ValidationError::new(
            "E_SCHEMA_INVALID_FORMAT",
            format!("unexpected field: {unexpected}"),
        ));
    }

    if let Some(version) = obj.get("schema_version").and_then(Value::as_str) {
        if version != kind.expected_schema_version() {
            errors.push(ValidationError::new(
                "E_SCHEMA_INVALID_FORMAT",
                format!("schema_version {version} does not match expected {}", kind.expected_schema_version()),
            ));
        }
    }

    if let Some(status) = obj.get("status").and_then(Value::as_str) {
        if !ALLOWED_STATUS.contains(&status) {
            errors.push(ValidationError::new("E_SCHEMA_INVALID_ENUM", format!("invalid status: {status}")));
        }
    }

    if let Some(nq) = obj.get("next_question").and_then(Value::as_str) {
        if nq.trim().is_empty() || !contains_question_mark(nq) {
            errors.push(ValidationError::new(
                "E_SCHEMA_INVALID_FORMAT",
                "next_question must be non-empty and contain '?' or '？'",
            ));
        }
    }

    Some(obj)
}

fn check_evidence_array(value: Option<&Value>, field: &str, errors: &mut Vec<ValidationError>) {
    let Some(items) = value.and_then(Value::as_array) else {
        errors.push(ValidationError::new("E_SCHEMA_INVALID_FORMAT", format!("{field} must be an array")));
        return;
    };
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            errors.push(ValidationError::new(
                "E_SCHEMA_INVALID_FORMAT",
                format!("{field}[{i}] must be an object"),
            ));
            continue;
        };
        for key in ["command", "result"] {
            if !obj.get(key).is_some_and(Value::is_string) {
                errors.push(ValidationError::new(
                    "E_SCHEMA_INVALID_FORMAT",
                    format!("{field}[{i}].{key} must be a string"),
                ));
            }
        }
    }
}

fn validate_plan_fields(obj: &Map<String, Value>, errors: &mut Vec<ValidationError>) {
    if let Some(v) = obj.get("requirement_breakdown") {
        if as_str_array(v, "requirement_breakdown", errors).is_empty() {
            errors.push(ValidationError::new(
                "E_SCHEMA_MISSING_FIELD",
                "requirement_breakdown must be non-empty",
            ));
        }
    }
    if let Some(v) = obj.get("acceptance_criteria") {
        if as_str_array(v, "acceptance_criteria", errors).is_empty() {
            errors.push(ValidationError::new("E_SCHEMA_MISSING_FIELD", "acceptance_criteria must be non-empty"));
        }
    }
}

fn validate_delivery_fields(obj: &Map<String, Value>, errors: &mut Vec<ValidationError>) {
    check_evidence_array(obj.get("execution_evidence"), "execution_evidence", errors);

    let Some(deliverables) = obj.get("deliverables").and_then(Value::as_array) else {
        errors.push(ValidationError::new("E_SCHEMA_INVALID_FORMAT", "deliverables must be an array"));
        return;
    };
    for (i, item) in deliverables.iter().enumerate() {
        let Some(d) = item.as_object() else {
            errors.push(ValidationError::new(
                "E_SCHEMA_INVALID_FORMAT",
                format!("deliverables[{i}] must be an object"),
            ));
            continue;
        };
        for key in ["path", "summary"] {
            if !d.get(key).is_some_and(Value::is_string) {
                errors.push(ValidationError::new(
                    "E_SCHEMA_INVALID_FORMAT",
                    format!("deliverables[{i}].{key} must be a string"),
                ));
            }
        }
        match d.get("kind").and_then(Value::as_str) {
            Some(kind) if ALLOWED_DELIVERABLE_KIND.contains(&kind) => {}
            Some(kind) => {
                errors.push(ValidationError::new(
                    "E_SCHEMA_INVALID_ENUM",
                    format!("deliverables[{i}].kind invalid: {kind}"),
                ));
            }
            None => {
                errors.push(ValidationError::new(
                    "E_SCHEMA_MISSING_FIELD",
                    format!("deliverables[{i}].kind missing"),
                ));
            }
        }
    }
}

fn validate_review_fields(obj: &Map<String, Value>, errors: &mut Vec<ValidationError>) {
    let verification_count = obj.get("verification").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
    check_evidence_array(obj.get("verification"), "verification", errors);
    if verification_count < 2 {
        errors.push(ValidationError::new(
            "E_REVIEW_EVIDENCE_MISSING",
            "verification must have at least 2 entries",
        ));
    }

    let mut has_p0_or_p1 = false;
    if let Some(issues) = obj.get("issues").and_then(Value::as_array) {
        for (i, issue) in issues.iter().enumerate() {
            let Some(issue) = issue.as_object() else {
                errors.push(ValidationError::new(
                    "E_SCHEMA_INVALID_FORMAT",
                    format!("issues[{i}] must be an object"),
                ));
                continue;
            };
            for key in ["id", "summary"] {
                if !issue.get(key).is_some_and(Value::is_string) {
                    errors.push(ValidationError::new(
                        "E_SCHEMA_INVALID_FORMAT",
                        format!("issues[{i}].{key} must be a string"),
                    ));
                }
            }
            match issue.get("severity").and_then(Value::as_str) {
                Some(sev) if ALLOWED_SEVERITY.contains(&sev) => {
                    if sev == "P0" || sev == "P1" {
                        has_p0_or_p1 = true;
                    }
                }
                Some(sev) => {
                    errors.push(ValidationError::new(
                        "E_SCHEMA_INVALID_ENUM",
                        format!("issues[{i}].severity invalid: {sev}"),
                    ));
                }
                None => {
                    errors.push(ValidationError::new(
                        "E_SCHEMA_MISSING_FIELD",
                        format!("issues[{i}].severity missing"),
                    ));
                }
            }
        }
    } else {
        errors.push(ValidationError::new("E_SCHEMA_INVALID_FORMAT", "issues must be an array"));
    }

    match obj.get("acceptance").and_then(Value::as_str) {
        Some(acc) if ALLOWED_ACCEPTANCE.contains(&acc) => {
            if acc == "pass" && has_p0_or_p1 {
                errors.push(ValidationError::new(
                    "E_REVIEW_GATE_INCONSISTENT",
                    "acceptance=pass is inconsistent with an open P0/P1 issue",
                ));
            }
        }
        Some(acc) => {
            errors.push(ValidationError::new("E_SCHEMA_INVALID_ENUM", format!("invalid acceptance: {acc}")));
        }
        None => errors.push(ValidationError::new("E_SCHEMA_MISSING_FIELD", "acceptance missing")),
    }

    match obj.get("gate").and_then(Value::as_object) {
        Some(gate) => match gate.get("decision").and_then(Value::as_str) {
            Some(d) if ALLOWED_GATE_DECISION.contains(&d) => {}
            Some(d) => errors.push(ValidationError::new(
                "E_SCHEMA_INVALID_ENUM",
                format!("invalid gate.decision: {d}"),
            )),
            None => errors.push(ValidationError::new("E_SCHEMA_MISSING_FIELD", "gate.decision missing")),
        },
        None => errors.push(ValidationError::new("E_SCHEMA_MISSING_FIELD", "gate missing")),
    }

    if obj.get("root_cause").is_some() {
        as_str_array(obj.get("root_cause").unwrap(), "root_cause", errors);
    } else {
        errors.push(ValidationError::new("E_SCHEMA_MISSING_FIELD", "root_cause missing"));
    }
}

/// Validates an already-parsed JSON value against `kind`'s shape. Use
/// [`validate_reply`] instead when the raw text might not even be JSON (the
/// review role gets a plain-text fallback).
pub fn validate_value(kind: PayloadKind, value: &Value) -> ProtocolValidationResult {
    let mut errors = Vec::new();
    let Some(obj) = check_common(kind, value, &mut errors) else {
        return ProtocolValidationResult::failure(errors);
    };

    match kind {
        PayloadKind::Plan => validate_plan_fields(obj, &mut errors),
        PayloadKind::Delivery => validate_delivery_fields(obj, &mut errors),
        PayloadKind::Review => validate_review_fields(obj, &mut errors),
    }

    ProtocolValidationResult {
        ok: errors.is_empty(),
        errors,
        warnings: Vec::new(),
        parsed_content: Some(value.clone()),
    }
}

/// Entry point used by the orchestrator: parses `raw` as JSON and validates
/// it against `kind`. For the review role, a reply that fails to parse is
/// given one heuristic second chance via [`adapt_plain_text_review`] before
/// being declared malformed.
pub fn validate_reply(kind: PayloadKind, raw: &str) -> ProtocolValidationResult {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => validate_value(kind, &value),
        Err(_) if kind == PayloadKind::Review => match adapt_plain_text_review(raw) {
            Some(adapted) => {
                let mut result = validate_value(kind, &adapted);
                result.warnings.push("auto_adapted_from_plain_text_review".to_string());
                result
            }
            None => ProtocolValidationResult::failure(vec![ValidationError::new(
                "E_SCHEMA_INVALID_FORMAT",
                "reply is not valid JSON",
            )]),
        },
        Err(_) => ProtocolValidationResult::failure(vec![ValidationError::new(
            "E_SCHEMA_INVALID_FORMAT",
            "reply is not valid JSON",
        )]),
    }
}

fn section(raw: &str, markers: &[&str]) -> Option<String> {
    for marker in markers {
        if let Some(pos) = raw.find(marker) {
            let rest = &raw[pos + marker.len()..];
            let end = rest.find("\n[").unwrap_or(rest.len());
            let body = rest[..end].trim_start_matches([':', '：']).trim();
            if !body.is_empty() {
                return Some(body.to_string());
            }
        }
    }
    None
}

/// Heuristically reconstructs a review payload from the legacy free-text
/// section-marker format. Returns `None` when none of the four markers are
/// present at all, leaving the caller to report a plain schema failure
/// instead of fabricating an empty review.
fn adapt_plain_text_review(raw: &str) -> Option<Value> {
    let has_any_marker = ["[验收结论]", "Acceptance Conclusion", "[核验清单]", "[问题清单]", "[回归门禁]"]
        .iter()
        .any(|m| raw.contains(m));
    if !has_any_marker {
        return None;
    }

    let conclusion = section(raw, &["[验收结论]", "Acceptance Conclusion"]).unwrap_or_default();
    let acceptance = if conclusion.contains("pass") || conclusion.contains("通过") {
        "pass"
    } else if conclusion.contains("conditional") || conclusion.contains("有条件") {
        "conditional"
    } else {
        "fail"
    };

    let bullet_re = Regex::new(r"(?m)^\s*[-*•]\s*(.+)$").expect("static regex");

    let verification_block = section(raw, &["[核验清单]"]).unwrap_or_default();
    let mut verification: Vec<Value> = bullet_re
        .captures_iter(&verification_block)
        .map(|c| serde_json::json!({"command": "static_review_evidence", "result": c[1].trim()}))
        .collect();
    while verification.len() < 2 {
        let n = verification.len() + 1;
        verification.push(serde_json::json!({
            "command": format!("static_review_evidence_{n}"),
            "result": "no command captured from plain-text review",
        }));
    }

    let issues_block = section(raw, &["[问题清单]"]).unwrap_or_default();
    let issues: Vec<Value> = bullet_re
        .captures_iter(&issues_block)
        .enumerate()
        .map(|(i, c)| {
            serde_json::json!({
                "id": format!("plain-text-{}", i + 1),
                "severity": "P2",
                "summary": c[1].trim(),
            })
        })
        .collect();

    let gate_block = section(raw, &["[回归门禁]"]).unwrap_or_default();
    let decision = if gate_block.contains("block") || gate_block.contains("阻断") {
        "block"
    } else if gate_block.contains("conditional") || gate_block.contains("有条件") {
        "conditional"
    } else {
        "allow"
    };

    Some(serde_json::json!({
        "schema_version": REVIEW_SCHEMA_VERSION,
        "status": "partial",
        "acceptance": acceptance,
        "verification": verification,
        "root_cause": Vec::<String>::new(),
        "issues": issues,
        "gate": {"decision": decision, "conditions": Vec::<String>::new()},
        "next_question": "是否继续下一轮？",
        "warnings": Vec::<String>::new(),
        "errors": Vec::<String>::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_plan() -> Value {
        json!({
            "schema_version": PLAN_SCHEMA_VERSION,
            "status": "ok",
            "requirement_breakdown": ["a", "b"],
            "implementation_scope": "scope",
            "acceptance_criteria": ["c1"],
            "handoff_notes": "notes",
            "warnings": [],
            "errors": [],
            "next_question": "ready to proceed?",
        })
    }

    #[test]
    fn valid_plan_passes() {
        let result = validate_value(PayloadKind::Plan, &valid_plan());
        assert!(result.ok, "{:?}", result.errors);
    }

    #[test]
    fn missing_field_is_reported() {
        let mut plan = valid_plan();
        plan.as_object_mut().unwrap().remove("handoff_notes");
        let result = validate_value(PayloadKind::Plan, &plan);
        assert!(!result.ok);
        assert!(result.errors.iter().any(|e| e.code == "E_SCHEMA_MISSING_FIELD"));
    }

    #[test]
    fn unexpected_field_is_reported() {
        let mut plan = valid_plan();
        plan.as_object_mut().unwrap().insert("extra".to_string(), json!(1));
        let result = validate_value(PayloadKind::Plan, &plan);
        assert!(!result.ok);
        assert!(result.errors.iter().any(|e| e.code == "E_SCHEMA_INVALID_FORMAT"));
    }

    #[test]
    fn next_question_without_question_mark_fails() {
        let mut plan = valid_plan();
        plan["next_question"] = json!("proceed.");
        let result = validate_value(PayloadKind::Plan, &plan);
        assert!(!result.ok);
    }

    #[test]
    fn review_pass_with_p0_issue_is_inconsistent() {
        let review = json!({
            "schema_version": REVIEW_SCHEMA_VERSION,
            "status": "ok",
            "acceptance": "pass",
            "verification": [
                {"command": "ls", "result": "ok"},
                {"command": "cat f", "result": "ok"},
            ],
            "root_cause": [],
            "issues": [{"id": "i1", "severity": "P0", "summary": "bad"}],
            "gate": {"decision": "allow", "conditions": []},
            "next_question": "merge now?",
            "warnings": [],
            "errors": [],
        });
        let result = validate_value(PayloadKind::Review, &review);
        assert!(result.errors.iter().any(|e| e.code == "E_REVIEW_GATE_INCONSISTENT"));
    }

    #[test]
    fn review_with_one_verification_entry_is_rejected() {
        let review = json!({
            "schema_version": REVIEW_SCHEMA_VERSION,
            "status": "ok",
            "acceptance": "conditional",
            "verification": [{"command": "ls", "result": "ok"}],
            "root_cause": [],
            "issues": [],
            "gate": {"decision": "conditional", "conditions": []},
            "next_question": "继续吗？",
            "warnings": [],
            "errors": [],
        });
        let result = validate_value(PayloadKind::Review, &review);
        assert!(result.errors.iter().any(|e| e.code == "E_REVIEW_EVIDENCE_MISSING"));
    }

    #[test]
    fn plain_text_review_is_adapted_and_validated() {
        let raw = "[验收结论] pass\n[核验清单]\n- ran tests\n- checked output\n[问题清单]\n- minor typo\n[回归门禁] allow\n";
        let result = validate_reply(PayloadKind::Review, raw);
        assert!(result.ok, "{:?}", result.errors);
        assert!(result.warnings.contains(&"auto_adapted_from_plain_text_review".to_string()));
    }

    #[test]
    fn non_json_non_review_reply_fails_without_adaptation() {
        let result = validate_reply(PayloadKind::Plan, "not json at all");
        assert!(!result.ok);
        assert!(result.parsed_content.is_none());
    }

    #[test]
    fn delivery_with_bad_deliverable_kind_fails() {
        let delivery = json!({
            "schema_version": DELIVERY_SCHEMA_VERSION,
            "status": "ok",
            "task_understanding": "u",
            "implementation_plan": "p",
            "execution_evidence": [{"command": "ls", "result": "ok"}],
            "risks_and_rollback": "r",
            "deliverables": [{"path": "/x", "kind": "socket", "summary": "s"}],
            "warnings": [],
            "errors": [],
            "next_question": "ok?",
        });
        let result = validate_value(PayloadKind::Delivery, &delivery);
        assert!(result.errors.iter().any(|e| e.code == "E_SCHEMA_INVALID_ENUM"));
    }
}
