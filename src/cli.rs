// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "roundtable",
    about = "Round-robin multi-agent dialogue orchestrator over external CLI providers",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a dialogue: DUFFY plans, LINA_BELL delivers, STELLA reviews, on repeat.
    Run {
        /// The task to hand to the dialogue. May also be piped on stdin.
        #[arg(value_name = "REQUEST")]
        request: Option<String>,

        /// Same as the positional REQUEST; takes precedence if both are given.
        #[arg(long)]
        request_flag: Option<String>,

        /// Number of DUFFY/LINA_BELL/STELLA turns to run. Defaults to the
        /// config's `dialogue.default_rounds`.
        #[arg(long)]
        rounds: Option<u32>,

        /// Which agent opens the dialogue (DUFFY, LINA_BELL, or STELLA).
        /// Defaults to the config's `dialogue.start_agent`.
        #[arg(long)]
        start_agent: Option<String>,

        /// Directory the dialogue operates in and the safety gate contains
        /// commands/deliverables to. Defaults to the current directory.
        #[arg(long, alias = "workdir")]
        project_path: Option<PathBuf>,

        /// Path to the TOML config file (overrides auto-discovery).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Deterministic run seed recorded in the audit trail. A random one
        /// is generated when omitted.
        #[arg(long)]
        seed: Option<u32>,

        /// Build and print the first turn's prompt without invoking any
        /// provider.
        #[arg(long)]
        dry_run: bool,

        /// Dump every constructed prompt to the audit log.
        #[arg(long)]
        dump_prompt: bool,

        /// Disable provider session resumption: every turn starts fresh.
        #[arg(long)]
        no_session: bool,

        /// Disable incremental stdout streaming from provider subprocesses.
        #[arg(long)]
        no_stream: bool,

        /// Named timeout profile (quick | standard | complex) or a profile
        /// defined under `[timeouts.<name>]` in the config.
        #[arg(long)]
        timeout_level: Option<String>,

        /// Maximum repair-prompt retries per turn after a validation or
        /// safety failure, before the run fails.
        #[arg(long)]
        max_protocol_retry: Option<u32>,
    },

    /// Print the effective configuration and exit.
    ShowConfig {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}
