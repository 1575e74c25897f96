// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Timeout profiles, failure taxonomy, and the truncated command
//! representation attached to every process failure.

use std::time::Duration;

/// Idle/max/grace triple selected by a named profile, with explicit
/// overrides layered on top. Named profiles mirror the reference
/// implementation's three timeout tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutConfig {
    pub idle_timeout: Duration,
    pub max_timeout: Duration,
    pub terminate_grace: Duration,
}

impl TimeoutConfig {
    pub fn quick() -> Self {
        TimeoutConfig {
            idle_timeout: Duration::from_secs_f64(60.0),
            max_timeout: Duration::from_secs_f64(300.0),
            terminate_grace: Duration::from_secs_f64(3.0),
        }
    }

    pub fn standard() -> Self {
        TimeoutConfig {
            idle_timeout: Duration::from_secs_f64(300.0),
            max_timeout: Duration::from_secs_f64(1800.0),
            terminate_grace: Duration::from_secs_f64(5.0),
        }
    }

    pub fn complex() -> Self {
        TimeoutConfig {
            idle_timeout: Duration::from_secs_f64(900.0),
            max_timeout: Duration::from_secs_f64(3600.0),
            terminate_grace: Duration::from_secs_f64(8.0),
        }
    }

    /// Resolves a named profile (`quick`/`standard`/`complex`, falling back
    /// to `standard` for anything else), then applies explicit overrides.
    pub fn resolve(
        profile: &str,
        idle_timeout_s: Option<f64>,
        max_timeout_s: Option<f64>,
        terminate_grace_s: Option<f64>,
    ) -> Self {
        let mut cfg = match profile {
            "quick" => Self::quick(),
            "complex" => Self::complex(),
            _ => Self::standard(),
        };
        if let Some(v) = idle_timeout_s {
            cfg.idle_timeout = Duration::from_secs_f64(v);
        }
        if let Some(v) = max_timeout_s {
            cfg.max_timeout = Duration::from_secs_f64(v);
        }
        if let Some(v) = terminate_grace_s {
            cfg.terminate_grace = Duration::from_secs_f64(v);
        }
        cfg
    }
}

/// Why the supervisor decided to terminate the child before it exited on
/// its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatedReason {
    IdleTimeout,
    MaxTimeout,
    ParentSignal,
    CallbackError,
}

impl TerminatedReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            TerminatedReason::IdleTimeout => "idle_timeout",
            TerminatedReason::MaxTimeout => "max_timeout",
            TerminatedReason::ParentSignal => "parent_signal",
            TerminatedReason::CallbackError => "callback_error",
        }
    }
}

/// Outcome of a successful (non-erroring) run.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub return_code: i32,
    pub elapsed_ms: u64,
}

/// The full failure taxonomy from the process runner. Every variant carries
/// enough context (provider, truncated command, elapsed time, stderr tail,
/// and last-known session id) to build a self-contained audit record or
/// decide retryability without re-deriving state.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch {provider} command: {message}")]
    LaunchError {
        provider: String,
        message: String,
        command_repr: String,
    },
    #[error("{provider} process terminated ({reason:?}) after {elapsed_ms}ms")]
    Terminated {
        provider: String,
        reason: TerminatedReason,
        command_repr: String,
        elapsed_ms: u64,
        stderr_tail: Vec<String>,
        session_id: Option<String>,
    },
    #[error("{provider} exited with code {return_code} after {elapsed_ms}ms")]
    NonzeroExit {
        provider: String,
        return_code: i32,
        command_repr: String,
        elapsed_ms: u64,
        stderr_tail: Vec<String>,
        session_id: Option<String>,
    },
}

impl ProcessError {
    /// Error-code string matching the conceptual taxonomy in the design doc
    /// (`launch_error`, `idle_timeout`, `max_timeout`, `nonzero_exit`, ...).
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProcessError::LaunchError { .. } => "launch_error",
            ProcessError::Terminated { reason, .. } => reason.as_code(),
            ProcessError::NonzeroExit { .. } => "nonzero_exit",
        }
    }

    pub fn stderr_tail(&self) -> &[String] {
        match self {
            ProcessError::Terminated { stderr_tail, .. } => stderr_tail,
            ProcessError::NonzeroExit { stderr_tail, .. } => stderr_tail,
            ProcessError::LaunchError { .. } => &[],
        }
    }

    /// Attaches the last-known provider session id, which the process
    /// runner itself has no notion of — only the adapter tracks it as it
    /// parses events — so it is filled in after the fact.
    pub fn with_session_id(mut self, id: Option<String>) -> Self {
        match &mut self {
            ProcessError::Terminated { session_id, .. } => *session_id = id,
            ProcessError::NonzeroExit { session_id, .. } => *session_id = id,
            ProcessError::LaunchError { .. } => {}
        }
        self
    }
}

const COMMAND_REPR_LIMIT: usize = 800;
/// Last N stderr lines kept for diagnostics, matching the reference
/// implementation's `stderr_tail` bound.
pub const STDERR_TAIL_LINES: usize = 20;

/// Builds the truncated, human-readable command representation attached to
/// every process failure: `program arg1 arg2 ...`, capped at 800 chars with
/// a `...<truncated N>` marker when longer.
pub fn build_command_repr(command: &str, argv: &[String]) -> String {
    let mut parts = Vec::with_capacity(argv.len() + 1);
    parts.push(command.to_string());
    parts.extend(argv.iter().cloned());
    let joined = parts.join(" ");

    let total_chars = joined.chars().count();
    if total_chars <= COMMAND_REPR_LIMIT {
        joined
    } else {
        let truncated: String = joined.chars().take(COMMAND_REPR_LIMIT).collect();
        format!("{truncated}...<truncated {}>", total_chars - COMMAND_REPR_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_command_is_unchanged() {
        assert_eq!(build_command_repr("codex", &["exec".to_string()]), "codex exec");
    }

    #[test]
    fn long_command_is_truncated_with_marker() {
        let argv = vec!["x".repeat(1000)];
        let repr = build_command_repr("codex", &argv);
        assert!(repr.starts_with("codex "));
        assert!(repr.contains("...<truncated"));
        assert!(repr.len() < 1000);
    }

    #[test]
    fn resolve_falls_back_to_standard_for_unknown_profile() {
        let cfg = TimeoutConfig::resolve("bogus", None, None, None);
        assert_eq!(cfg, TimeoutConfig::standard());
    }

    #[test]
    fn resolve_applies_explicit_overrides() {
        let cfg = TimeoutConfig::resolve("quick", Some(10.0), None, None);
        assert_eq!(cfg.idle_timeout, Duration::from_secs_f64(10.0));
        assert_eq!(cfg.max_timeout, TimeoutConfig::quick().max_timeout);
    }
}
