// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Per-provider session ID persistence.
//!
//! Stores one opaque session token per provider in a small JSON file at
//! `./.sessions/session-store.json`. The session is a hint, not a
//! correctness requirement: any read/write error yields the empty mapping
//! and a debug-level log line rather than a hard failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_store_path() -> PathBuf {
    PathBuf::from(".sessions").join("session-store.json")
}

/// One provider's stored session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// The on-disk mapping: `provider name -> {sessionId, updatedAt}`.
pub type SessionMap = HashMap<String, SessionEntry>;

/// File-backed session store. Holds only a path; every operation reads or
/// writes the file directly so the store reflects concurrent external edits
/// (e.g. a sibling run) on the next call, at the cost of a read per call.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore { path: default_store_path() }
    }
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    fn load(&self) -> SessionMap {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return SessionMap::new();
        };
        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "session store corrupt, treating as empty");
                SessionMap::new()
            }
        }
    }

    /// Atomically writes `map` to disk: temp file in the same directory,
    /// `sync_all`, then rename over the destination. Never panics on
    /// failure — the caller only sees a logged debug line.
    fn save(&self, map: &SessionMap) {
        if let Err(err) = self.try_save(map) {
            debug!(path = %self.path.display(), error = %err, "failed to persist session store");
        }
    }

    fn try_save(&self, map: &SessionMap) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let body = serde_json::to_vec_pretty(map)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, &body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Returns the stored session id for `provider`, if any.
    pub fn get(&self, provider: &str) -> Option<String> {
        self.load().get(provider).map(|e| e.session_id.clone())
    }

    /// Stores `session_id` for `provider`, stamping `updatedAt` with the
    /// current UTC time. Read-modify-write is not atomic across processes;
    /// last writer wins per the external interface contract.
    pub fn set(&self, provider: &str, session_id: &str) {
        let mut map = self.load();
        map.insert(
            provider.to_string(),
            SessionEntry {
                session_id: session_id.to_string(),
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.save(&map);
    }

    /// Removes any stored session for `provider` (used by the invoke
    /// gateway's stale-session recovery path).
    pub fn clear(&self, provider: &str) {
        let mut map = self.load();
        if map.remove(provider).is_some() {
            self.save(&map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session-store.json"));
        assert_eq!(store.get("codex"), None);
    }

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session-store.json"));
        store.set("codex", "abc-123");
        assert_eq!(store.get("codex"), Some("abc-123".to_string()));
    }

    #[test]
    fn clear_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session-store.json"));
        store.set("codex", "abc-123");
        store.clear("codex");
        assert_eq!(store.get("codex"), None);
    }

    #[test]
    fn entries_for_other_providers_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session-store.json"));
        store.set("codex", "aaa");
        store.set("claude-minimax", "bbb");
        store.clear("codex");
        assert_eq!(store.get("claude-minimax"), Some("bbb".to_string()));
        assert_eq!(store.get("codex"), None);
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-store.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = SessionStore::new(path);
        assert_eq!(store.get("codex"), None);
    }
}
