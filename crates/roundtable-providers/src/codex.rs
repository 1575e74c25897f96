// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! `codex` CLI adapter.
//!
//! Grounded on the reference `codex` provider: resolves the binary from
//! `CODEX_BIN`, builds `codex exec [resume SESSION_ID] PROMPT --json
//! --skip-git-repo-check [--output-schema FILE] [mode flag]`, and tracks
//! `thread.started`/`item.completed`/`agent_message_delta` events to
//! reconstruct the assistant's final text.

use std::env;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::event::{text_from_parts, Event};

pub const PROVIDER_NAME: &str = "codex";

/// Resolves the codex binary: `CODEX_BIN` env var if set, else the bare
/// `codex` name (resolved via `PATH` at spawn time).
pub fn resolve_command() -> String {
    env::var("CODEX_BIN").unwrap_or_else(|_| "codex".to_string())
}

/// Maps the dialogue-level execution mode onto codex's sandbox flags.
/// `execute` grants full filesystem+network access for this run;
/// `text_only` requests approval-free read/plan behavior without giving the
/// agent write access; anything else (including `safe`, the default) adds
/// no extra flag and lets codex apply its own default sandboxing.
pub fn mode_flag(exec_mode: &str) -> Option<&'static str> {
    match exec_mode {
        "execute" => Some("--dangerously-bypass-approvals-and-sandbox"),
        "full_auto" => Some("--full-auto"),
        _ => None,
    }
}

/// Builds the argv for one invocation (the program name itself is resolved
/// separately via [`resolve_command`]).
pub fn build_args(
    prompt: &str,
    session_id: Option<&str>,
    exec_mode: &str,
    output_schema_path: Option<&Path>,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(sid) = session_id {
        args.push("resume".to_string());
        args.push(sid.to_string());
    }
    args.push(prompt.to_string());
    args.push("--json".to_string());
    args.push("--skip-git-repo-check".to_string());
    if let Some(flag) = mode_flag(exec_mode) {
        args.push(flag.to_string());
    }
    if let Some(schema_path) = output_schema_path {
        args.push("--output-schema".to_string());
        args.push(schema_path.to_string_lossy().into_owned());
    }
    args
}

/// Writes `schema` to a fresh temp file and returns its path, for use with
/// `--output-schema`. Codex reads the schema from disk rather than accepting
/// it inline.
pub fn write_output_schema(schema: &Value) -> std::io::Result<(tempfile::NamedTempFile, PathBuf)> {
    let file = tempfile::NamedTempFile::new()?;
    std::fs::write(file.path(), serde_json::to_vec_pretty(schema)?)?;
    let path = file.path().to_path_buf();
    Ok((file, path))
}

/// Per-turn parse state threaded across successive [`parse_line`] calls so a
/// delta seen on one line suppresses a duplicate whole-message event on a
/// later line.
#[derive(Debug, Default)]
pub struct ParseState {
    pub thread_id: Option<String>,
    saw_delta: bool,
}

/// Decodes one NDJSON line into zero or more normalized events. Returns an
/// empty vec for lines that parse as JSON but carry no text/session content
/// worth surfacing (the caller still gets the raw line for audit purposes
/// via its own logging, not via this adapter).
pub fn parse_line(line: &str, state: &mut ParseState) -> Vec<Event> {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        return vec![];
    };

    let mut out = Vec::new();
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "thread.started" => {
            if let Some(id) = event.get("thread_id").and_then(Value::as_str) {
                state.thread_id = Some(id.to_string());
                out.push(Event::SessionId { session_id: id.to_string() });
            }
        }
        "item.completed" => {
            let item = event.get("item").cloned().unwrap_or(Value::Null);
            let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
            if matches!(item_type, "agent_message" | "assistant") && !state.saw_delta {
                let text = text_from_parts(&item);
                if !text.is_empty() {
                    out.push(Event::AssistantMessage { text });
                }
            }
        }
        "agent_message_delta" => {
            let text = text_from_parts(&event);
            if !text.is_empty() {
                state.saw_delta = true;
                out.push(Event::StreamDelta { text });
            }
        }
        "agent_message" | "assistant" => {
            if !state.saw_delta {
                let text = text_from_parts(&event);
                if !text.is_empty() {
                    out.push(Event::AssistantMessage { text });
                }
            }
        }
        _ => {
            if event.get("role").and_then(Value::as_str) == Some("assistant") && !state.saw_delta {
                let text = text_from_parts(&event);
                if !text.is_empty() {
                    out.push(Event::AssistantMessage { text });
                }
            } else if out.is_empty() {
                return vec![Event::Unknown { raw: event }];
            }
        }
    }
    out
}
