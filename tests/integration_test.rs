// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! End-to-end tests driving the orchestrator's public entry point directly,
//! without spawning a real provider subprocess.

use std::collections::VecDeque;
use std::sync::Mutex;

use roundtable_audit::AuditLogger;
use roundtable_config::Config;
use roundtable_orchestrator::{run_dialogue, run_with_invoker, Invoker, RunRequest, RunStatus};
use roundtable_providers::{InvokeError, InvokeRequest, InvokeResult};
use roundtable_session::SessionStore;

/// Hands back one scripted reply per call, in order, regardless of which
/// agent/provider is asking — enough to drive the turn loop end to end
/// without spawning a real provider subprocess.
struct ScriptedInvoker {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedInvoker {
    fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        ScriptedInvoker { replies: Mutex::new(replies.into_iter().map(Into::into).collect()) }
    }
}

#[async_trait::async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&self, req: &InvokeRequest<'_>, _sessions: &SessionStore) -> Result<InvokeResult, InvokeError> {
        let text = self.replies.lock().unwrap().pop_front().expect("scripted reply exhausted");
        Ok(InvokeResult { provider: req.provider.to_string(), text, session_id: None, elapsed_ms: 1 })
    }
}

fn test_config() -> Config {
    Config::default()
}

#[tokio::test]
async fn dry_run_builds_prompt_and_finalizes_without_invoking_a_provider() {
    let workdir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(log_dir.path(), Some(7)).unwrap();
    let sessions = SessionStore::new(workdir.path().join("sessions.json"));
    let config = test_config();

    let req = RunRequest {
        user_request: "please check minimal task",
        rounds: Some(3),
        start_agent: Some("DUFFY"),
        workdir: workdir.path(),
        timeout_level: None,
        config: &config,
        dry_run: true,
        dump_prompt: true,
        max_protocol_retry: None,
    };

    let outcome = run_dialogue(req, &sessions, &audit).await.unwrap();
    assert_eq!(outcome.status, RunStatus::DryRun);
    assert!(outcome.turns.is_empty());

    let log_contents = std::fs::read_to_string(&outcome.log.log_file).unwrap();
    assert!(log_contents.contains("run.started"));
    assert!(log_contents.contains("prompt.dump"));

    let summary = std::fs::read_to_string(&outcome.log.summary_file).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(summary["status"], "dry_run");
}

#[tokio::test]
async fn unknown_start_agent_fails_before_any_invocation() {
    let workdir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(log_dir.path(), Some(1)).unwrap();
    let sessions = SessionStore::new(workdir.path().join("sessions.json"));
    let config = test_config();

    let req = RunRequest {
        user_request: "task",
        rounds: Some(1),
        start_agent: Some("NOT_A_REAL_AGENT"),
        workdir: workdir.path(),
        timeout_level: None,
        config: &config,
        dry_run: false,
        dump_prompt: false,
        max_protocol_retry: None,
    };

    let result = run_dialogue(req, &sessions, &audit).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn xxx_provider_round_trip_is_rejected_by_the_schema_validator() {
    // The "xxx" placeholder provider returns plain text, which is not a
    // conforming plan payload; confirms the validator (not just invoke)
    // gates what reaches the transcript.
    use roundtable_providers::{run_invoke, InvokeRequest};
    use roundtable_protocol::{validate_reply, PayloadKind};

    let workdir = tempfile::tempdir().unwrap();
    let sessions = SessionStore::new(workdir.path().join("sessions.json"));
    let req = InvokeRequest {
        provider: "xxx",
        prompt: "please check minimal task",
        workdir: None,
        exec_mode: "text_only",
        permission_mode: None,
        allowed_tools: &[],
        disallowed_tools: &[],
        output_schema: None,
        timeout: roundtable_process::TimeoutConfig::quick(),
        retry_attempts: 0,
        retry_backoff_s: 0.0,
    };
    let result = run_invoke(&req, &sessions).await.unwrap();
    let validation = validate_reply(PayloadKind::Plan, &result.text);
    assert!(!validation.ok);
}

#[tokio::test]
async fn full_plan_delivery_review_cycle_accepts_every_turn() {
    let workdir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(log_dir.path(), Some(3)).unwrap();
    let sessions = SessionStore::new(workdir.path().join("sessions.json"));
    let config = test_config();

    let plan = serde_json::json!({
        "schema_version": "roundtable.plan.v1",
        "status": "ok",
        "requirement_breakdown": ["parse the request", "implement the widget"],
        "implementation_scope": "add a widget to the dashboard",
        "acceptance_criteria": ["widget renders", "tests pass"],
        "handoff_notes": "see implementation_scope",
        "warnings": [],
        "errors": [],
        "next_question": "any constraints on styling?",
    })
    .to_string();

    let delivery = serde_json::json!({
        "schema_version": "roundtable.delivery.v1",
        "status": "ok",
        "task_understanding": "add a widget to the dashboard",
        "implementation_plan": "render a card component and wire it up",
        "execution_evidence": [{"command": "pytest tests/widget", "result": "3 passed"}],
        "risks_and_rollback": "revert the single commit if needed",
        "deliverables": [],
        "warnings": [],
        "errors": [],
        "next_question": "ready for review?",
    })
    .to_string();

    let review = serde_json::json!({
        "schema_version": "roundtable.review.v1",
        "status": "ok",
        "acceptance": "pass",
        "verification": [
            {"command": "pytest tests/widget", "result": "3 passed"},
            {"command": "pytest tests/dashboard", "result": "ok"},
        ],
        "root_cause": [],
        "issues": [],
        "gate": {"decision": "allow", "conditions": []},
        "next_question": "merge now?",
        "warnings": [],
        "errors": [],
    })
    .to_string();

    let invoker = ScriptedInvoker::new([plan.as_str(), delivery.as_str(), review.as_str()]);

    let req = RunRequest {
        user_request: "add a widget to the dashboard",
        rounds: Some(3),
        start_agent: Some("DUFFY"),
        workdir: workdir.path(),
        timeout_level: None,
        config: &config,
        dry_run: false,
        dump_prompt: false,
        max_protocol_retry: None,
    };

    let outcome = run_with_invoker(req, &sessions, &audit, &invoker).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.turns.len(), 3);
    assert_eq!(outcome.turns[0].agent, "DUFFY");
    assert_eq!(outcome.turns[1].agent, "LINA_BELL");
    assert_eq!(outcome.turns[2].agent, "STELLA");
    assert!(outcome.turns.iter().all(|t| t.attempt == 1));

    let log_contents = std::fs::read_to_string(&outcome.log.log_file).unwrap();
    assert!(log_contents.contains("protocol.task.envelope"));
    assert!(log_contents.contains("turn.attempt.completed"));
}

#[tokio::test]
async fn safety_violation_triggers_repair_retry_then_succeeds() {
    let workdir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();
    let audit = AuditLogger::new(log_dir.path(), Some(9)).unwrap();
    let sessions = SessionStore::new(workdir.path().join("sessions.json"));
    let config = test_config();

    // First attempt references a path outside the workdir, which the
    // safety gate's workdir-containment check rejects even though the
    // payload is otherwise a well-formed delivery.
    let unsafe_delivery = serde_json::json!({
        "schema_version": "roundtable.delivery.v1",
        "status": "ok",
        "task_understanding": "add a widget to the dashboard",
        "implementation_plan": "render a card component and wire it up",
        "execution_evidence": [{"command": "cat /etc/passwd", "result": "leaked"}],
        "risks_and_rollback": "revert the single commit if needed",
        "deliverables": [],
        "warnings": [],
        "errors": [],
        "next_question": "ready for review?",
    })
    .to_string();

    let safe_delivery = serde_json::json!({
        "schema_version": "roundtable.delivery.v1",
        "status": "ok",
        "task_understanding": "add a widget to the dashboard",
        "implementation_plan": "render a card component and wire it up",
        "execution_evidence": [{"command": "pytest tests/widget", "result": "3 passed"}],
        "risks_and_rollback": "revert the single commit if needed",
        "deliverables": [],
        "warnings": [],
        "errors": [],
        "next_question": "ready for review?",
    })
    .to_string();

    let invoker = ScriptedInvoker::new([unsafe_delivery.as_str(), safe_delivery.as_str()]);

    let req = RunRequest {
        user_request: "add a widget to the dashboard",
        rounds: Some(1),
        start_agent: Some("LINA_BELL"),
        workdir: workdir.path(),
        timeout_level: None,
        config: &config,
        dry_run: false,
        dump_prompt: false,
        max_protocol_retry: None,
    };

    let outcome = run_with_invoker(req, &sessions, &audit, &invoker).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.turns.len(), 1);
    assert_eq!(outcome.turns[0].attempt, 2);

    let log_contents = std::fs::read_to_string(&outcome.log.log_file).unwrap();
    assert!(log_contents.contains("turn.attempt.failed"));
    assert!(log_contents.contains("E_WORKDIR_COMMAND_OUTSIDE"));
}
