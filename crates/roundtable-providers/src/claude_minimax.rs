// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! `claude` CLI adapter (used for both the "claude" and "minimax" roster
//! entries, which share the same Claude Code-compatible wire format).
//!
//! Grounded on the reference `claude_minimax` provider: resolves the binary
//! from `CLAUDE_BIN`, builds `claude --output-format stream-json --verbose
//! [--include-partial-messages] [--permission-mode MODE] -r SESSION_ID -p
//! PROMPT`, and tracks `stream_event`/`assistant`/`result` events.

use std::env;

use serde_json::Value;

use crate::event::{text_from_parts, Event};

pub const PROVIDER_NAME: &str = "claude-minimax";

pub fn resolve_command() -> String {
    env::var("CLAUDE_BIN").unwrap_or_else(|_| "claude".to_string())
}

pub struct BuildArgsOptions<'a> {
    pub prompt: &'a str,
    pub session_id: Option<&'a str>,
    pub permission_mode: Option<&'a str>,
    pub allowed_tools: &'a [String],
    pub disallowed_tools: &'a [String],
    pub include_partial_messages: bool,
}

pub fn build_args(opts: &BuildArgsOptions<'_>) -> Vec<String> {
    let mut args = vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if opts.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    if let Some(mode) = opts.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.to_string());
    }
    if !opts.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(opts.allowed_tools.join(","));
    }
    if !opts.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(opts.disallowed_tools.join(","));
    }
    if let Some(sid) = opts.session_id {
        args.push("-r".to_string());
        args.push(sid.to_string());
    }
    args.push("-p".to_string());
    args.push(opts.prompt.to_string());
    args
}

/// Extracts `type: text` blocks from an `assistant` event's `message.content`
/// array, joining them with no separator (matching how Claude streams
/// contiguous text blocks).
fn text_from_assistant_message(message: &Value) -> String {
    let Some(content) = message.get("content").and_then(Value::as_array) else {
        return String::new();
    };
    content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

#[derive(Debug, Default)]
pub struct ParseState {
    pub session_id: Option<String>,
    saw_text_delta: bool,
    printed_fallback: bool,
}

pub fn parse_line(line: &str, state: &mut ParseState) -> Vec<Event> {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        return vec![];
    };

    let mut out = Vec::new();
    if let Some(sid) = event.get("session_id").and_then(Value::as_str) {
        if state.session_id.as_deref() != Some(sid) {
            state.session_id = Some(sid.to_string());
            out.push(Event::SessionId { session_id: sid.to_string() });
        }
    }

    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "stream_event" => {
            let inner = event.get("event").cloned().unwrap_or(Value::Null);
            if inner.get("type").and_then(Value::as_str) == Some("content_block_delta") {
                let delta = inner.get("delta").cloned().unwrap_or(Value::Null);
                if delta.get("type").and_then(Value::as_str) == Some("text_delta") {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            state.saw_text_delta = true;
                            out.push(Event::StreamDelta { text: text.to_string() });
                        }
                    }
                }
            }
        }
        "assistant" => {
            if !state.saw_text_delta {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                let text = text_from_assistant_message(&message);
                if !text.is_empty() {
                    state.printed_fallback = true;
                    out.push(Event::AssistantMessage { text });
                }
            }
        }
        "result" => {
            if event.get("subtype").and_then(Value::as_str) == Some("success")
                && !state.saw_text_delta
                && !state.printed_fallback
            {
                if let Some(text) = event.get("result").and_then(Value::as_str) {
                    if !text.is_empty() {
                        out.push(Event::ResultMessage { text: text.to_string() });
                    }
                }
            }
        }
        _ => {
            if out.is_empty() {
                return vec![Event::Unknown { raw: event }];
            }
        }
    }
    out
}
