// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Envelope and payload shapes exchanged between the orchestrator and the
//! agents it drives.
//!
//! Grounded on the reference `protocol/models.py`: the wrapper fields
//! (`status`, `warnings`, `errors`, `next_question`) and the envelope shape
//! are carried over field-for-field; the `schema_version` tag strings are
//! renamed from the source's `friendsbar.*` namespace to `roundtable.*` to
//! match this crate's own naming (see the design ledger).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const ENVELOPE_SCHEMA_VERSION: &str = "roundtable.envelope.v1";
pub const PLAN_SCHEMA_VERSION: &str = "roundtable.plan.v1";
pub const DELIVERY_SCHEMA_VERSION: &str = "roundtable.delivery.v1";
pub const REVIEW_SCHEMA_VERSION: &str = "roundtable.review.v1";

pub const ALLOWED_STATUS: &[&str] = &["ok", "partial", "failed"];
pub const ALLOWED_ACCEPTANCE: &[&str] = &["pass", "conditional", "fail"];
pub const ALLOWED_GATE_DECISION: &[&str] = &["allow", "conditional", "block"];
pub const ALLOWED_SEVERITY: &[&str] = &["P0", "P1", "P2"];
pub const ALLOWED_DELIVERABLE_KIND: &[&str] = &["file", "dir"];

/// Returns the current UTC time as an ISO-8601 timestamp with millisecond
/// precision, e.g. `2026-08-01T12:00:00.000Z`.
pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Orchestrator-to-agent hand-off record. Constructed once per run and
/// written to the audit trail; never sent to the agent's stdin verbatim
/// (its `content` is folded into the prompt template instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub trace_id: String,
    pub schema_version: String,
    pub sender: String,
    pub recipient: String,
    pub role: String,
    pub timestamp: String,
    pub content: Value,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub meta: Value,
}

pub struct BuildTaskEnvelopeArgs<'a> {
    pub trace_id: &'a str,
    pub sender: &'a str,
    pub recipient: &'a str,
    pub intent: &'a str,
    pub user_request: &'a str,
    pub workdir: &'a str,
    pub timeout_level: &'a str,
    pub expected_schema_version: &'a str,
}

pub fn build_task_envelope(args: BuildTaskEnvelopeArgs<'_>) -> Envelope {
    Envelope {
        message_id: Uuid::new_v4().to_string(),
        trace_id: args.trace_id.to_string(),
        schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
        sender: args.sender.to_string(),
        recipient: args.recipient.to_string(),
        role: "task".to_string(),
        timestamp: utc_now_iso(),
        content: serde_json::json!({
            "intent": args.intent,
            "user_request": args.user_request,
            "workdir": args.workdir,
            "timeout_level": args.timeout_level,
            "expected_schema_version": args.expected_schema_version,
        }),
        attachments: Vec::new(),
        meta: Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_task_envelope_fills_content_and_role() {
        let envelope = build_task_envelope(BuildTaskEnvelopeArgs {
            trace_id: "trace-1",
            sender: "orchestrator",
            recipient: "duffy",
            intent: "plan",
            user_request: "add a widget",
            workdir: "/tmp/work",
            timeout_level: "standard",
            expected_schema_version: PLAN_SCHEMA_VERSION,
        });
        assert_eq!(envelope.role, "task");
        assert_eq!(envelope.schema_version, ENVELOPE_SCHEMA_VERSION);
        assert_eq!(envelope.content["intent"], "plan");
        assert_eq!(envelope.content["expected_schema_version"], PLAN_SCHEMA_VERSION);
    }
}
