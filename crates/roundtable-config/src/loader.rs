// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use toml::Value;
use tracing::debug;

use crate::Config;

/// `(mtime_seconds, len)` per file path, used to decide whether a cached
/// config is still fresh without re-reading and re-parsing every call.
type Signature = (Option<i64>, Option<u64>);

struct CacheEntry {
    signature: (Signature, Signature),
    config: Config,
}

static CACHE: Mutex<Option<(PathBuf, CacheEntry)>> = Mutex::new(None);

fn file_signature(path: &Path) -> Signature {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            (mtime, Some(meta.len()))
        }
        Err(_) => (None, None),
    }
}

/// `config.toml` -> `config.local.toml`; `config` (no ext) -> `config.local`.
fn local_override_path(base: &Path) -> PathBuf {
    let stem = base.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = base.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default();
    let name = if ext.is_empty() { format!("{stem}.local") } else { format!("{stem}.local.{ext}") };
    base.with_file_name(name)
}

fn read_toml_table(path: &Path) -> Value {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Value::Table(Default::default());
    };
    match raw.parse::<Value>() {
        Ok(v @ Value::Table(_)) => v,
        _ => Value::Table(Default::default()),
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
/// Mirrors the original YAML merge, generalized to `toml::Value`.
fn merge_toml(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Table(dst_map), Value::Table(src_map)) => {
            for (key, src_val) in src_map {
                match dst_map.get_mut(key) {
                    Some(dst_val) => merge_toml(dst_val, src_val),
                    None => {
                        dst_map.insert(key.clone(), src_val.clone());
                    }
                }
            }
        }
        (dst_slot, src_val) => *dst_slot = src_val.clone(),
    }
}

/// Loads the runtime config from `config_path`, deep-merging a
/// `<stem>.local.<ext>` override on top, both layered over the built-in
/// defaults (`Config::default()`).
///
/// Caches by absolute path; the cache is invalidated whenever either file's
/// mtime or size changes. Always returns a fresh deep copy — the caller owns
/// the returned `Config`, and mutating it never affects the next `load()`.
pub fn load(config_path: &Path) -> anyhow::Result<Config> {
    let abs_path =
        std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    let local_path = local_override_path(&abs_path);
    let signature = (file_signature(&abs_path), file_signature(&local_path));

    {
        let cache = CACHE.lock().unwrap();
        if let Some((cached_path, entry)) = cache.as_ref() {
            if *cached_path == abs_path && entry.signature == signature {
                debug!(path = %abs_path.display(), "config cache hit");
                return Ok(entry.config.clone());
            }
        }
    }
    debug!(path = %abs_path.display(), "config cache miss, reloading");

    let mut merged =
        toml::Value::try_from(Config::default()).context("serializing built-in default config")?;
    merge_toml(&mut merged, &read_toml_table(&abs_path));
    merge_toml(&mut merged, &read_toml_table(&local_path));

    let config: Config = merged
        .try_into()
        .with_context(|| format!("deserializing merged config for {}", abs_path.display()))?;

    let mut cache = CACHE.lock().unwrap();
    *cache = Some((abs_path, CacheEntry { signature, config: config.clone() }));

    Ok(config)
}

/// Clears the in-process config cache. Exposed for tests that write a new
/// file to a path that might already carry a cache entry from an earlier test.
#[cfg(test)]
pub fn clear_cache() {
    *CACHE.lock().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, contents: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.dialogue.default_rounds, 4);
        assert_eq!(cfg.dialogue.start_agent, "DUFFY");
    }

    #[test]
    fn load_overrides_scalar_and_preserves_the_rest() {
        clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(&path, "[dialogue]\ndefault_rounds = 7\n");
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.dialogue.default_rounds, 7);
        assert_eq!(cfg.dialogue.start_agent, "DUFFY");
    }

    #[test]
    fn local_override_wins_over_base() {
        clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let local = dir.path().join("config.local.toml");
        write(&path, "[dialogue]\ndefault_rounds = 7\n");
        write(&local, "[dialogue]\ndefault_rounds = 9\n");
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.dialogue.default_rounds, 9);
    }

    #[test]
    fn cache_invalidates_on_mtime_and_size_change() {
        clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(&path, "[dialogue]\ndefault_rounds = 2\n");
        let first = load(&path).unwrap();
        assert_eq!(first.dialogue.default_rounds, 2);

        std::thread::sleep(std::time::Duration::from_millis(10));
        write(&path, "[dialogue]\ndefault_rounds = 12\n\n\n");
        let second = load(&path).unwrap();
        assert_eq!(second.dialogue.default_rounds, 12);
    }

    #[test]
    fn returned_config_is_a_fresh_copy() {
        clear_cache();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write(&path, "[dialogue]\ndefault_rounds = 3\n");
        let mut cfg = load(&path).unwrap();
        cfg.dialogue.default_rounds = 999;
        let reloaded = load(&path).unwrap();
        assert_eq!(reloaded.dialogue.default_rounds, 3);
    }
}
