// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Normalized view over the heterogeneous NDJSON event streams emitted by
//! each provider CLI. Adapters translate provider-specific shapes into this
//! common set so the invoke gateway never special-cases a vendor format.

use serde_json::Value;

/// One decoded line of a provider's event stream, reduced to the pieces the
/// gateway and orchestrator actually care about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An incremental chunk of assistant text (e.g. `agent_message_delta`,
    /// `content_block_delta`). Once a stream has produced one of these, an
    /// adapter suppresses any duplicate whole-message events that would
    /// otherwise repeat the same text.
    StreamDelta { text: String },
    /// A complete assistant message event, used only when no delta has been
    /// seen yet for this turn.
    AssistantMessage { text: String },
    /// A terminal summary/result event carrying the final text (e.g.
    /// Claude's `result` event with `subtype: success`).
    ResultMessage { text: String },
    /// The provider reported (or updated) its own session/thread id.
    SessionId { session_id: String },
    /// A tool invocation the provider's own agent loop performed internally.
    /// Carried through for audit purposes only; not used for text assembly.
    ToolUse { name: String, raw: Value },
    /// An event shape this adapter doesn't recognize. Preserved so audit
    /// logging can still record the raw line.
    Unknown { raw: Value },
}

/// Recursively extracts text from the nested str/list/dict shapes providers
/// use for "content" fields: a plain string, a list of parts (recursed), or
/// a dict with one of `text`/`output_text`/`content`/`delta`/`message`.
pub fn text_from_parts(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(text_from_parts).collect::<Vec<_>>().join(""),
        Value::Object(map) => {
            for key in ["text", "output_text", "content", "delta", "message"] {
                if let Some(inner) = map.get(key) {
                    let extracted = text_from_parts(inner);
                    if !extracted.is_empty() {
                        return extracted;
                    }
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

/// True when `text` parses as a single JSON object (as opposed to an array,
/// scalar, or non-JSON prose) — the shape a structured reply is expected to
/// take, and therefore the preferred candidate when several are available.
pub fn is_single_json_object(text: &str) -> bool {
    matches!(serde_json::from_str::<Value>(text), Ok(Value::Object(_)))
}

/// Collapses a string made of two identical halves, each a JSON object,
/// down to one copy. Adapters occasionally replay the same final JSON
/// payload twice across the event stream (once as a delta tail, once as a
/// whole message); this undoes exactly that shape and leaves anything else
/// untouched.
pub fn collapse(text: &str) -> String {
    if text.is_empty() || text.len() % 2 != 0 || !text.is_char_boundary(text.len() / 2) {
        return text.to_string();
    }
    let (a, b) = text.split_at(text.len() / 2);
    if a == b && is_single_json_object(a) {
        a.to_string()
    } else {
        text.to_string()
    }
}

/// Ranks a candidate: a single JSON object beats plain text, and within a
/// tier the longer candidate wins.
fn rank(text: &str) -> (bool, usize) {
    (is_single_json_object(text), text.len())
}

fn pick_candidate(candidates: &[String]) -> Option<String> {
    candidates.iter().cloned().max_by(|a, b| rank(a).cmp(&rank(b)))
}

/// Reduces one turn's full event stream to a single final text.
///
/// Deltas, when present, are concatenated in arrival order (they are the
/// only source guaranteed not to duplicate a later whole-message event,
/// since adapters suppress those once a delta has been seen). Otherwise the
/// result tier is preferred over the assistant-message tier, and within
/// whichever tier is used, [`pick_candidate`] selects the best-shaped,
/// longest candidate. [`collapse`] is applied last so an accidentally
/// doubled JSON object still reduces to one copy.
pub fn reconcile(deltas: &[String], results: &[String], assistants: &[String]) -> String {
    if !deltas.is_empty() {
        return collapse(&deltas.concat());
    }
    let tier = if !results.is_empty() { results } else { assistants };
    collapse(&pick_candidate(tier).unwrap_or_default())
}
