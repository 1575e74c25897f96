// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_timeout_level() -> String {
    "standard".to_string()
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_retry_backoff_s() -> f64 {
    1.0
}

fn default_rounds() -> u32 {
    4
}

fn default_start_agent() -> String {
    "DUFFY".to_string()
}

/// Top-level runtime config, deserialized from TOML.
///
/// Every section has field-level defaults so a config-free run is already
/// usable; `Config::default()` is deep-merged underneath whatever is read
/// from disk (see [`crate::loader::load`]), so a partial file only needs to
/// override what it disagrees with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub timeouts: HashMap<String, TimeoutProfile>,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "codex".to_string(),
            ProviderConfig {
                timeout_level: default_timeout_level(),
                retry_attempts: default_retry_attempts(),
                exec_mode: Some("safe".to_string()),
                permission_mode: None,
                extra: HashMap::new(),
            },
        );
        providers.insert(
            "claude-minimax".to_string(),
            ProviderConfig {
                timeout_level: default_timeout_level(),
                retry_attempts: default_retry_attempts(),
                exec_mode: None,
                permission_mode: Some("default".to_string()),
                extra: HashMap::new(),
            },
        );

        let mut timeouts = HashMap::new();
        timeouts.insert(
            "quick".to_string(),
            TimeoutProfile { idle_timeout_s: 60.0, max_timeout_s: 300.0, terminate_grace_s: 3.0 },
        );
        timeouts.insert(
            "standard".to_string(),
            TimeoutProfile { idle_timeout_s: 300.0, max_timeout_s: 1800.0, terminate_grace_s: 5.0 },
        );
        timeouts.insert(
            "complex".to_string(),
            TimeoutProfile { idle_timeout_s: 900.0, max_timeout_s: 3600.0, terminate_grace_s: 8.0 },
        );

        Config {
            defaults: Defaults::default(),
            providers,
            dialogue: DialogueConfig::default(),
            timeouts,
        }
    }
}

/// Global defaults applied when a per-provider or per-call value is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_true")]
    pub use_session: bool,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default = "default_timeout_level")]
    pub timeout_level: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_s")]
    pub retry_backoff_s: f64,
}

fn default_provider() -> String {
    "codex".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            provider: default_provider(),
            use_session: true,
            stream: true,
            timeout_level: default_timeout_level(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_s: default_retry_backoff_s(),
        }
    }
}

/// Per-provider options. `exec_mode` is codex-specific, `permission_mode` is
/// claude-minimax-specific; unrecognized keys land in `extra` so a config
/// file can carry forward-looking provider options without a schema bump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_timeout_level")]
    pub timeout_level: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

/// The dialogue roster and its safety/history/logging knobs — the `friends_bar`
/// section of the original config, renamed for the three-role DUFFY /
/// LINA_BELL / STELLA roster this implementation drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    #[serde(default = "default_dialogue_name")]
    pub name: String,
    #[serde(default = "default_rounds")]
    pub default_rounds: u32,
    #[serde(default = "default_start_agent")]
    pub start_agent: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

fn default_dialogue_name() -> String {
    "Roundtable".to_string()
}

impl Default for DialogueConfig {
    fn default() -> Self {
        let mut agents = HashMap::new();
        agents.insert(
            "DUFFY".to_string(),
            AgentConfig {
                provider: "codex".to_string(),
                response_mode: "execute".to_string(),
                provider_options: HashMap::new(),
            },
        );
        agents.insert(
            "LINA_BELL".to_string(),
            AgentConfig {
                provider: "claude-minimax".to_string(),
                response_mode: "text_only".to_string(),
                provider_options: HashMap::new(),
            },
        );
        agents.insert(
            "STELLA".to_string(),
            AgentConfig {
                provider: "codex".to_string(),
                response_mode: "execute".to_string(),
                provider_options: HashMap::new(),
            },
        );

        DialogueConfig {
            name: default_dialogue_name(),
            default_rounds: default_rounds(),
            start_agent: default_start_agent(),
            logging: LoggingConfig::default(),
            history: HistoryConfig::default(),
            safety: SafetyConfig::default(),
            agents,
        }
    }
}

/// One dialogue participant: which provider backs it, and whether it may
/// execute tools (`execute`) or must answer in plain reasoning (`text_only`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub provider: String,
    #[serde(default = "default_response_mode")]
    pub response_mode: String,
    #[serde(default)]
    pub provider_options: HashMap<String, toml::Value>,
}

fn default_response_mode() -> String {
    "text_only".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_true")]
    pub include_prompt_preview: bool,
    #[serde(default = "default_max_preview_chars")]
    pub max_preview_chars: usize,
}

fn default_log_dir() -> String {
    ".roundtable/logs".to_string()
}

fn default_max_preview_chars() -> usize {
    1200
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            enabled: true,
            dir: default_log_dir(),
            include_prompt_preview: true,
            max_preview_chars: default_max_preview_chars(),
        }
    }
}

/// Bounds applied when compressing the transcript into a per-turn prompt
/// (see §4.7.1 of the design doc — history summarization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_field_max_chars")]
    pub field_max_chars: usize,
    #[serde(default = "default_evidence_limit")]
    pub evidence_limit: usize,
    #[serde(default = "default_issue_limit")]
    pub issue_limit: usize,
    #[serde(default = "default_root_cause_limit")]
    pub root_cause_limit: usize,
    #[serde(default = "default_true")]
    pub include_key_changes: bool,
}

fn default_max_chars() -> usize {
    6000
}
fn default_field_max_chars() -> usize {
    800
}
fn default_evidence_limit() -> usize {
    8
}
fn default_issue_limit() -> usize {
    8
}
fn default_root_cause_limit() -> usize {
    5
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            max_chars: default_max_chars(),
            field_max_chars: default_field_max_chars(),
            evidence_limit: default_evidence_limit(),
            issue_limit: default_issue_limit(),
            root_cause_limit: default_root_cause_limit(),
            include_key_changes: true,
        }
    }
}

/// Safety-gate policy (see `roundtable-orchestrator::safety`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub allowed_roots: Vec<String>,
    #[serde(default)]
    pub command_allowlist: Vec<String>,
    #[serde(default)]
    pub command_denylist: Vec<String>,
    #[serde(default)]
    pub claude_tools_read_only: bool,
}

/// One named timeout profile (`quick` / `standard` / `complex`), or a custom
/// one referenced by name from `--timeout-level`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutProfile {
    pub idle_timeout_s: f64,
    pub max_timeout_s: f64,
    pub terminate_grace_s: f64,
}
