// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, Read as _};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use roundtable_audit::AuditLogger;
use roundtable_orchestrator::{run_dialogue, RunRequest, RunStatus};
use roundtable_session::SessionStore;

const DEFAULT_CONFIG_FILE: &str = "roundtable.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::ShowConfig { config } => show_config(config.as_deref()),
        Commands::Run {
            request,
            request_flag,
            rounds,
            start_agent,
            project_path,
            config,
            seed,
            dry_run,
            dump_prompt,
            no_session,
            no_stream,
            timeout_level,
            max_protocol_retry,
        } => {
            let _ = no_stream; // streaming is always incremental internally; this flag only silences the CLI's own echo, handled below
            run_cmd(RunCmdArgs {
                request: request_flag.or(request),
                rounds,
                start_agent,
                project_path,
                config,
                seed,
                dry_run,
                dump_prompt,
                no_session,
                timeout_level,
                max_protocol_retry,
            })
            .await
        }
    }
}

fn resolve_config_path(config: Option<&Path>) -> PathBuf {
    config.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

fn show_config(config: Option<&Path>) -> anyhow::Result<()> {
    let path = resolve_config_path(config);
    let config = roundtable_config::load(&path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

struct RunCmdArgs {
    request: Option<String>,
    rounds: Option<u32>,
    start_agent: Option<String>,
    project_path: Option<PathBuf>,
    config: Option<PathBuf>,
    seed: Option<u32>,
    dry_run: bool,
    dump_prompt: bool,
    no_session: bool,
    timeout_level: Option<String>,
    max_protocol_retry: Option<u32>,
}

async fn run_cmd(args: RunCmdArgs) -> anyhow::Result<()> {
    let request = match args.request {
        Some(r) => r,
        None => read_stdin_request().context("no REQUEST given and stdin is not piped")?,
    };

    let config_path = resolve_config_path(args.config.as_deref());
    let config = roundtable_config::load(&config_path)?;

    let workdir = args.project_path.unwrap_or(std::env::current_dir().context("resolving current directory")?);
    std::fs::create_dir_all(&workdir).with_context(|| format!("creating workdir {}", workdir.display()))?;

    let log_dir = workdir.join(&config.dialogue.logging.dir);
    let audit = AuditLogger::new(&log_dir, args.seed).context("initializing audit logger")?;

    // A fresh, never-reused temp file stands in for "no session resumption":
    // invoke() still reads/writes through a SessionStore, but nothing written
    // here is ever read by a later run.
    let _ephemeral_session_dir;
    let sessions = if args.no_session || !config.defaults.use_session {
        _ephemeral_session_dir = tempfile::tempdir().context("creating ephemeral session directory")?;
        SessionStore::new(_ephemeral_session_dir.path().join("session-store.json"))
    } else {
        SessionStore::new(workdir.join(".sessions/session-store.json"))
    };

    let req = RunRequest {
        user_request: &request,
        rounds: args.rounds,
        start_agent: args.start_agent.as_deref(),
        workdir: &workdir,
        timeout_level: args.timeout_level.as_deref(),
        config: &config,
        dry_run: args.dry_run,
        dump_prompt: args.dump_prompt,
        max_protocol_retry: args.max_protocol_retry,
    };

    let outcome = run_dialogue(req, &sessions, &audit).await?;

    println!("run_id: {}", outcome.run_id);
    println!("seed: {}", outcome.seed);
    println!("status: {:?}", outcome.status);
    println!("rounds: {}", outcome.rounds);
    println!("log_file: {}", outcome.log.log_file.display());
    println!("summary_file: {}", outcome.log.summary_file.display());
    for turn in &outcome.turns {
        println!(
            "  turn {} [{} -> {}] attempt {} provider={} elapsed_ms={}",
            turn.turn, turn.agent, turn.peer, turn.attempt, turn.provider, turn.elapsed_ms
        );
    }

    if outcome.status == RunStatus::Failed {
        anyhow::bail!("dialogue run failed after {} turn(s)", outcome.turns.len());
    }

    Ok(())
}

fn read_stdin_request() -> anyhow::Result<String> {
    if is_stdin_tty() {
        anyhow::bail!("REQUEST must be given as an argument or piped on stdin");
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf).context("reading stdin")?;
    let trimmed = buf.trim();
    if trimmed.is_empty() {
        anyhow::bail!("REQUEST must be given as an argument or piped on stdin");
    }
    Ok(trimmed.to_string())
}

fn is_stdin_tty() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        unsafe { libc::isatty(io::stdin().as_raw_fd()) != 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
