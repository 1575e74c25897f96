// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Append-only, crash-resistant audit trail for one orchestrator run.
//!
//! One JSONL line per lifecycle event, plus a finalized summary document
//! written atomically so readers never see a half-written file.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Canonical event names, in the order a successful run emits them. Not
/// every event fires on every run (`?`-suffixed ones in the design are
/// conditional); this list exists so callers reference a name once instead
/// of scattering string literals.
pub mod events {
    pub const RUN_STARTED: &str = "run.started";
    pub const PROTOCOL_TASK_ENVELOPE: &str = "protocol.task.envelope";
    pub const ROUND_STARTED: &str = "round.started";
    pub const TURN_STARTED: &str = "turn.started";
    pub const PROMPT_STATS: &str = "prompt.stats";
    pub const PROMPT_DUMP: &str = "prompt.dump";
    pub const TURN_ATTEMPT_STARTED: &str = "turn.attempt.started";
    pub const PROTOCOL_VALIDATED: &str = "protocol.validated";
    pub const WORKDIR_VERIFY: &str = "workdir.verify";
    pub const DELIVERY_VERIFY: &str = "delivery.verify";
    pub const TURN_ATTEMPT_COMPLETED: &str = "turn.attempt.completed";
    pub const TURN_ATTEMPT_FAILED: &str = "turn.attempt.failed";
    pub const TURN_COMPLETED: &str = "turn.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_FINALIZED: &str = "run.finalized";
}

/// `{chars, sha256, preview}` describing a piece of text without always
/// carrying the full body into the log line.
#[derive(Debug, Clone, Serialize)]
pub struct TextMeta {
    pub chars: usize,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Summarizes `text`, including up to `preview_chars` of it verbatim when
/// `include_preview` is set (matching the config knob that makes preview
/// boundedness configurable rather than fixed).
pub fn text_meta(text: &str, include_preview: bool, preview_chars: usize) -> TextMeta {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let sha256 = hex::encode(hasher.finalize());
    let preview = include_preview.then(|| text.chars().take(preview_chars).collect());
    TextMeta { chars: text.chars().count(), sha256, preview }
}

#[derive(Debug, Clone, Serialize)]
struct AuditRecord<'a> {
    ts: String,
    run_id: &'a str,
    seed: u32,
    event: &'a str,
    payload: Value,
}

/// One run's append-only JSONL event stream plus its final summary file.
pub struct AuditLogger {
    run_id: String,
    seed: u32,
    log_path: PathBuf,
    summary_path: PathBuf,
    turn_count: std::sync::atomic::AtomicU64,
    failure_count: std::sync::atomic::AtomicU64,
}

impl AuditLogger {
    /// Creates a logger rooted at `dir`, generating a fresh `run_id`
    /// (`uuid::Uuid::new_v4().simple()`, matching `uuid.uuid4().hex`) and,
    /// if `seed` is `None`, a random 32-bit seed.
    pub fn new(dir: impl AsRef<Path>, seed: Option<u32>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).with_context(|| format!("creating audit dir {}", dir.display()))?;

        let run_id = Uuid::new_v4().simple().to_string();
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen::<u32>());
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%fZ").to_string();

        Ok(AuditLogger {
            log_path: dir.join(format!("{timestamp}_{run_id}.jsonl")),
            summary_path: dir.join(format!("{timestamp}_{run_id}.summary.json")),
            run_id,
            seed,
            turn_count: std::sync::atomic::AtomicU64::new(0),
            failure_count: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Appends one event as a single line. Best-effort: a write failure is
    /// logged at debug level and otherwise swallowed, since a broken audit
    /// trail must never abort the orchestrated dialogue it is observing.
    pub fn log(&self, event: &str, payload: Value) {
        if event == events::TURN_COMPLETED {
            self.turn_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        if event == events::TURN_ATTEMPT_FAILED || event == events::RUN_FAILED {
            self.failure_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        if let Err(err) = self.try_log(event, payload) {
            debug!(event, error = %err, "audit log write failed");
        }
    }

    fn try_log(&self, event: &str, payload: Value) -> Result<()> {
        let record = AuditRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            run_id: &self.run_id,
            seed: self.seed,
            event,
            payload,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Writes the final run summary atomically (temp file + rename).
    /// Best-effort like [`Self::log`]: failure is logged, not propagated.
    pub fn finalize(&self, status: &str, extra: Value) {
        if let Err(err) = self.try_finalize(status, extra) {
            debug!(error = %err, "audit summary write failed");
        }
    }

    fn try_finalize(&self, status: &str, extra: Value) -> Result<()> {
        let summary = serde_json::json!({
            "run_id": self.run_id,
            "seed": self.seed,
            "status": status,
            "turn_count": self.turn_count.load(std::sync::atomic::Ordering::Relaxed),
            "failure_count": self.failure_count.load(std::sync::atomic::Ordering::Relaxed),
            "finalized_at": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "extra": extra,
        });
        let body = serde_json::to_vec_pretty(&summary)?;

        let parent = self.summary_path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.summary_path).map_err(|e| e.error)?;
        Ok(())
    }
}
