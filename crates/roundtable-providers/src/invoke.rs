// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Invoke gateway: resolves a provider alias to a concrete adapter, runs the
//! subprocess via the process runner, reassembles the reply text from the
//! adapter's event stream, and retries on transient failure.
//!
//! Grounded on the reference `invoke()` dispatcher for alias resolution and
//! the retry/backoff loop, and on `codex.py`/`claude_minimax.py` for the
//! per-provider argv and event-to-text reduction.

use std::path::Path;
use std::time::Duration;

use roundtable_process::{ProcessError, RunOptions, TimeoutConfig};
use roundtable_session::SessionStore;
use serde_json::Value;

use crate::event::{self, Event};
use crate::{claude_minimax, codex, xxx};

/// Closed set of adapters this gateway knows how to drive. New providers
/// are added here, not by string-matching scattered through the codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Codex,
    ClaudeMinimax,
    Xxx,
}

impl ProviderKind {
    /// Maps an agent-roster alias onto its adapter. Accepts the canonical
    /// provider name plus the historical aliases carried over from the
    /// two-provider naming in the reference implementation.
    pub fn normalize(alias: &str) -> Option<Self> {
        match alias {
            "codex" => Some(ProviderKind::Codex),
            "claude-minimax" | "claude" | "minimax" => Some(ProviderKind::ClaudeMinimax),
            "xxx" => Some(ProviderKind::Xxx),
            _ => None,
        }
    }

    pub fn canonical_name(&self) -> &'static str {
        match self {
            ProviderKind::Codex => codex::PROVIDER_NAME,
            ProviderKind::ClaudeMinimax => claude_minimax::PROVIDER_NAME,
            ProviderKind::Xxx => xxx::PROVIDER_NAME,
        }
    }
}

pub struct InvokeRequest<'a> {
    pub provider: &'a str,
    pub prompt: &'a str,
    pub workdir: Option<&'a Path>,
    pub exec_mode: &'a str,
    pub permission_mode: Option<&'a str>,
    pub allowed_tools: &'a [String],
    pub disallowed_tools: &'a [String],
    pub output_schema: Option<&'a Value>,
    pub timeout: TimeoutConfig,
    pub retry_attempts: u32,
    pub retry_backoff_s: f64,
}

#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub provider: String,
    pub text: String,
    pub session_id: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown provider alias: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "temporarily",
    "try again",
    "429",
    "503",
    "504",
    "connection",
    "network",
    "rate limit",
    "tls",
    "ssl",
    "bad record",
];

fn is_transient(stderr_tail: &[String]) -> bool {
    let joined = stderr_tail.join("\n").to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| joined.contains(marker))
}

/// Not derivable from any reference provider snapshot available at
/// transformation time; implemented directly from the design's description
/// of the behavior since the Python reference never added it explicitly.
fn is_stale_session(stderr_tail: &[String]) -> bool {
    let joined = stderr_tail.join("\n").to_lowercase();
    joined.contains("no conversation found with session id")
}

/// Invokes `req.provider` with `req.prompt`, retrying transient failures
/// with exponential backoff and unconditionally retrying once, with the
/// stored session cleared, if the provider reports a stale/unknown session.
pub async fn invoke(req: &InvokeRequest<'_>, sessions: &SessionStore) -> Result<InvokeResult, InvokeError> {
    let kind = ProviderKind::normalize(req.provider)
        .ok_or_else(|| InvokeError::UnknownProvider(req.provider.to_string()))?;

    let mut attempt = 0u32;
    let mut cleared_stale = false;

    loop {
        let session_id = sessions.get(kind.canonical_name());
        match run_once(kind, req, session_id.as_deref()).await {
            Ok(result) => {
                if let Some(sid) = &result.session_id {
                    sessions.set(kind.canonical_name(), sid);
                }
                return Ok(result);
            }
            Err(err) => {
                let stderr_tail = err.stderr_tail();

                if !cleared_stale && session_id.is_some() && is_stale_session(stderr_tail) {
                    sessions.clear(kind.canonical_name());
                    cleared_stale = true;
                    continue;
                }

                if attempt < req.retry_attempts && is_transient(stderr_tail) {
                    attempt += 1;
                    let backoff = req.retry_backoff_s * 2f64.powi(attempt as i32 - 1);
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    continue;
                }

                return Err(InvokeError::Process(err));
            }
        }
    }
}

async fn run_once(
    kind: ProviderKind,
    req: &InvokeRequest<'_>,
    session_id: Option<&str>,
) -> Result<InvokeResult, ProcessError> {
    if kind == ProviderKind::Xxx {
        return Ok(InvokeResult {
            provider: kind.canonical_name().to_string(),
            text: xxx::placeholder_reply(req.prompt),
            session_id: session_id.map(|s| s.to_string()),
            elapsed_ms: 0,
        });
    }

    let command;
    let args;
    let _schema_guard;

    match kind {
        ProviderKind::Codex => {
            command = codex::resolve_command();
            let schema_path = match req.output_schema {
                Some(schema) => {
                    let (file, path) =
                        codex::write_output_schema(schema).map_err(|e| ProcessError::LaunchError {
                            provider: kind.canonical_name().to_string(),
                            message: e.to_string(),
                            command_repr: command.clone(),
                        })?;
                    _schema_guard = Some(file);
                    Some(path)
                }
                None => {
                    _schema_guard = None;
                    None
                }
            };
            args = codex::build_args(req.prompt, session_id, req.exec_mode, schema_path.as_deref());
        }
        ProviderKind::ClaudeMinimax => {
            command = claude_minimax::resolve_command();
            _schema_guard = None;
            let opts = claude_minimax::BuildArgsOptions {
                prompt: req.prompt,
                session_id,
                permission_mode: req.permission_mode,
                allowed_tools: req.allowed_tools,
                disallowed_tools: req.disallowed_tools,
                include_partial_messages: true,
            };
            args = claude_minimax::build_args(&opts);
        }
        ProviderKind::Xxx => unreachable!("handled above"),
    }

    let mut deltas: Vec<String> = Vec::new();
    let mut results: Vec<String> = Vec::new();
    let mut assistants: Vec<String> = Vec::new();
    let mut observed_session_id: Option<String> = None;
    let mut codex_state = codex::ParseState::default();
    let mut claude_state = claude_minimax::ParseState::default();

    let run_opts = RunOptions {
        provider: kind.canonical_name(),
        command: &command,
        argv: &args,
        workdir: req.workdir,
        env: &[],
        timeout: req.timeout,
        stdin_text: None,
        inherit_stdin: false,
    };

    let result = roundtable_process::run(
        run_opts,
        |line| {
            let events = match kind {
                ProviderKind::Codex => codex::parse_line(line, &mut codex_state),
                ProviderKind::ClaudeMinimax => claude_minimax::parse_line(line, &mut claude_state),
                ProviderKind::Xxx => unreachable!("handled above"),
            };
            for ev in events {
                match ev {
                    Event::StreamDelta { text: t } => deltas.push(t),
                    Event::AssistantMessage { text: t } => assistants.push(t),
                    Event::ResultMessage { text: t } => results.push(t),
                    Event::SessionId { session_id: sid } => observed_session_id = Some(sid),
                    Event::ToolUse { .. } | Event::Unknown { .. } => {}
                }
            }
        },
        |_line| {},
    )
    .await
    .map_err(|e| e.with_session_id(observed_session_id.clone()))?;

    let text = event::reconcile(&deltas, &results, &assistants);

    Ok(InvokeResult {
        provider: kind.canonical_name().to_string(),
        text,
        session_id: observed_session_id.or_else(|| session_id.map(|s| s.to_string())),
        elapsed_ms: result.elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_aliases() {
        assert_eq!(ProviderKind::normalize("codex"), Some(ProviderKind::Codex));
        assert_eq!(ProviderKind::normalize("claude"), Some(ProviderKind::ClaudeMinimax));
        assert_eq!(ProviderKind::normalize("minimax"), Some(ProviderKind::ClaudeMinimax));
        assert_eq!(ProviderKind::normalize("nope"), None);
    }

    #[test]
    fn transient_markers_match_case_insensitively() {
        assert!(is_transient(&["Connection RESET by peer".to_string()]));
        assert!(is_transient(&["HTTP 503 Service Unavailable".to_string()]));
        assert!(!is_transient(&["permission denied".to_string()]));
    }

    #[test]
    fn stale_session_marker_detected() {
        assert!(is_stale_session(&["Error: no conversation found with session ID abc".to_string()]));
        assert!(!is_stale_session(&["some other error".to_string()]));
    }

    #[tokio::test]
    async fn xxx_provider_short_circuits_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("sessions.json"));
        let req = InvokeRequest {
            provider: "xxx",
            prompt: "ping",
            workdir: None,
            exec_mode: "text_only",
            permission_mode: None,
            allowed_tools: &[],
            disallowed_tools: &[],
            output_schema: None,
            timeout: TimeoutConfig::quick(),
            retry_attempts: 0,
            retry_backoff_s: 0.0,
        };
        let result = invoke(&req, &sessions).await.unwrap();
        assert_eq!(result.text, "[xxx placeholder] prompt received: ping");
    }

    #[tokio::test]
    async fn unknown_provider_alias_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("sessions.json"));
        let req = InvokeRequest {
            provider: "not-a-provider",
            prompt: "ping",
            workdir: None,
            exec_mode: "text_only",
            permission_mode: None,
            allowed_tools: &[],
            disallowed_tools: &[],
            output_schema: None,
            timeout: TimeoutConfig::quick(),
            retry_attempts: 0,
            retry_backoff_s: 0.0,
        };
        assert!(matches!(invoke(&req, &sessions).await, Err(InvokeError::UnknownProvider(_))));
    }
}
