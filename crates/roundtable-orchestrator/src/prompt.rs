// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Per-turn prompt construction, including the repair-prompt variant used
//! when a reply fails validation or safety.
//!
//! Grounded on §4.7 of the design: a shared system preamble, the task goal,
//! the bounded history block, the peer's last `next_question`, the output
//! contract, a mode clause, and the hard output-format rules.

use roundtable_protocol::validator::ValidationError;

use crate::agent::AgentId;

const OUTPUT_RULES: &str = "Output exactly one JSON object. The first character of your reply must be '{' and the last must be '}'. The `next_question` field must contain '?' or '？'.";

fn mode_clause(response_mode: &str) -> &'static str {
    match response_mode {
        "execute" => "You may use tools and make filesystem changes within the provided workdir.",
        _ => "You must not use tools or write to the filesystem; answer in plain reasoning only.",
    }
}

fn role_mission(agent: AgentId) -> &'static str {
    match agent {
        AgentId::Duffy => "You are the planner. Break the user's request into a concrete, verifiable implementation plan.",
        AgentId::LinaBell => "You are the developer. Execute the plan and report what you did with evidence.",
        AgentId::Stella => "You are the reviewer. Verify the delivery against the plan's acceptance criteria.",
    }
}

fn output_contract(agent: AgentId) -> &'static str {
    match agent {
        AgentId::Duffy => {
            r#"Reply with: {"schema_version":"roundtable.plan.v1","status":"ok|partial|failed","requirement_breakdown":["..."],"implementation_scope":"...","acceptance_criteria":["..."],"handoff_notes":"...","warnings":[],"errors":[],"next_question":"...?"}"#
        }
        AgentId::LinaBell => {
            r#"Reply with: {"schema_version":"roundtable.delivery.v1","status":"ok|partial|failed","task_understanding":"...","implementation_plan":"...","execution_evidence":[{"command":"...","result":"..."}],"risks_and_rollback":"...","deliverables":[{"path":"...","kind":"file|dir","summary":"..."}],"warnings":[],"errors":[],"next_question":"...?"}"#
        }
        AgentId::Stella => {
            r#"Reply with: {"schema_version":"roundtable.review.v1","status":"ok|partial|failed","acceptance":"pass|conditional|fail","verification":[{"command":"...","result":"..."}],"root_cause":["..."],"issues":[{"id":"...","severity":"P0|P1|P2","summary":"..."}],"gate":{"decision":"allow|conditional|block","conditions":["..."]},"warnings":[],"errors":[],"next_question":"...?"}"#
        }
    }
}

pub struct PromptContext<'a> {
    pub agent: AgentId,
    pub user_request: &'a str,
    pub history_block: &'a str,
    pub peer_next_question: Option<&'a str>,
    pub response_mode: &'a str,
}

/// Builds the first-pass prompt for one turn.
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut sections = vec![
        role_mission(ctx.agent).to_string(),
        format!("USER REQUEST:\n{}", ctx.user_request),
    ];
    if !ctx.history_block.is_empty() {
        sections.push(ctx.history_block.to_string());
    }
    if let Some(q) = ctx.peer_next_question {
        sections.push(format!("The previous agent asked: {q}"));
    }
    sections.push(mode_clause(ctx.response_mode).to_string());
    sections.push(output_contract(ctx.agent).to_string());
    sections.push(OUTPUT_RULES.to_string());
    sections.join("\n\n")
}

/// Builds a repair prompt: the original prompt plus the prior validation
/// errors and a truncated copy of the previous (rejected) output.
pub fn build_repair_prompt(
    ctx: &PromptContext<'_>,
    previous_errors: &[ValidationError],
    previous_output: &str,
    previous_output_max_chars: usize,
) -> String {
    let base = build_prompt(ctx);
    let truncated: String = previous_output.chars().take(previous_output_max_chars).collect();
    let error_lines: Vec<String> = previous_errors.iter().map(|e| format!("- [{}] {}", e.code, e.message)).collect();
    format!(
        "{base}\n\nYour previous reply was rejected for these reasons:\n{}\n\nYour previous reply was:\n{truncated}\n\nReply again, fixing every issue above, following the exact schema.",
        error_lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext<'static> {
        PromptContext {
            agent: AgentId::Duffy,
            user_request: "please check minimal task",
            history_block: "",
            peer_next_question: None,
            response_mode: "execute",
        }
    }

    #[test]
    fn prompt_includes_output_rules_and_contract() {
        let prompt = build_prompt(&ctx());
        assert!(prompt.contains("first character of your reply must be '{'"));
        assert!(prompt.contains("roundtable.plan.v1"));
    }

    #[test]
    fn text_only_mode_forbids_tools() {
        let mut c = ctx();
        c.response_mode = "text_only";
        let prompt = build_prompt(&c);
        assert!(prompt.contains("must not use tools"));
    }

    #[test]
    fn repair_prompt_includes_errors_and_previous_output() {
        let errors = vec![ValidationError::new("E_SCHEMA_MISSING_FIELD", "missing field: handoff_notes")];
        let repaired = build_repair_prompt(&ctx(), &errors, "{\"bad\": true}", 100);
        assert!(repaired.contains("E_SCHEMA_MISSING_FIELD"));
        assert!(repaired.contains("\"bad\": true"));
    }

    #[test]
    fn peer_question_is_surfaced() {
        let mut c = ctx();
        c.peer_next_question = Some("is this acceptable?");
        let prompt = build_prompt(&c);
        assert!(prompt.contains("is this acceptable?"));
    }
}
