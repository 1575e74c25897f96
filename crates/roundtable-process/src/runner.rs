// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Subprocess supervisor: spawns a provider CLI, drains stdout/stderr on
//! bounded background tasks, and enforces idle/max timeouts with a graceful
//! terminate-then-kill sequence.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{
    build_command_repr, ProcessError, ProcessResult, TerminatedReason, TimeoutConfig,
    STDERR_TAIL_LINES,
};

const CHANNEL_CAPACITY: usize = 256;
const DEADLINE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Everything needed to spawn and supervise one provider subprocess call.
pub struct RunOptions<'a> {
    pub provider: &'a str,
    pub command: &'a str,
    pub argv: &'a [String],
    pub workdir: Option<&'a Path>,
    pub env: &'a [(String, String)],
    pub timeout: TimeoutConfig,
    pub stdin_text: Option<&'a str>,
    pub inherit_stdin: bool,
}

fn build_command(opts: &RunOptions<'_>) -> Command {
    let mut cmd = Command::new(opts.command);
    cmd.args(opts.argv);
    if let Some(wd) = opts.workdir {
        cmd.current_dir(wd);
    }
    for (k, v) in opts.env {
        cmd.env(k, v);
    }

    if opts.stdin_text.is_some() {
        cmd.stdin(std::process::Stdio::piped());
    } else if opts.inherit_stdin {
        cmd.stdin(std::process::Stdio::inherit());
    } else {
        cmd.stdin(std::process::Stdio::null());
    }
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    // Backstop: if this future is ever dropped mid-flight (e.g. the
    // orchestrator is cancelled), don't leave an orphaned child behind.
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            // Detach from the controlling terminal so a misbehaving
            // provider can't read from /dev/tty mid-run.
            libc::setsid();
            Ok(())
        });
    }

    cmd
}

/// Sends SIGTERM (Unix) to the child as a soft stop before a hard kill.
#[cfg(unix)]
fn send_soft_stop(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_soft_stop(_child: &Child) {}

/// Resolves once the parent process receives an interrupt or (on Unix) a
/// terminate signal. Installed fresh per call so a borrowed handler never
/// outlives the run it supervises.
#[cfg(unix)]
async fn wait_for_parent_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_parent_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn terminate(child: &mut Child, grace: Duration) {
    send_soft_stop(child);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Runs `command argv...` to completion.
///
/// `on_stdout_line`/`on_stderr_line` are invoked from this task only (never
/// from the drainer tasks), preserving single-threaded semantics for
/// whatever stateful parser the caller is driving.
pub async fn run(
    opts: RunOptions<'_>,
    mut on_stdout_line: impl FnMut(&str),
    mut on_stderr_line: impl FnMut(&str),
) -> Result<ProcessResult, ProcessError> {
    let command_repr = build_command_repr(opts.command, opts.argv);
    let start = Instant::now();

    let mut cmd = build_command(&opts);
    let mut child = cmd.spawn().map_err(|e| ProcessError::LaunchError {
        provider: opts.provider.to_string(),
        message: e.to_string(),
        command_repr: command_repr.clone(),
    })?;

    if let Some(text) = opts.stdin_text {
        if let Some(mut stdin) = child.stdin.take() {
            let text = text.to_string();
            tokio::spawn(async move {
                let _ = stdin.write_all(text.as_bytes()).await;
                // Dropping `stdin` here closes the pipe so the child sees EOF.
            });
        }
    }

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (tx, mut rx) = mpsc::channel::<(Stream, String)>(CHANNEL_CAPACITY);
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let stdout_task = spawn_drainer(stdout, Stream::Stdout, tx.clone(), last_activity.clone());
    let stderr_task = spawn_drainer(stderr, Stream::Stderr, tx.clone(), last_activity.clone());
    drop(tx);

    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut terminated_reason: Option<TerminatedReason> = None;
    let mut exit_status: Option<std::process::ExitStatus> = None;
    let mut callback_err: Option<String> = None;

    let mut deadline_tick = tokio::time::interval(DEADLINE_POLL_INTERVAL);
    let mut child_reaped = false;

    let parent_signal = wait_for_parent_signal();
    tokio::pin!(parent_signal);

    loop {
        if child_reaped && terminated_reason.is_some() {
            break;
        }
        if child_reaped {
            // Drain whatever is left in the channel without blocking
            // further on the deadline ticker.
            match rx.try_recv() {
                Ok((stream, line)) => {
                    deliver_line(
                        stream,
                        line,
                        &mut on_stdout_line,
                        &mut on_stderr_line,
                        &mut stderr_tail,
                        &mut callback_err,
                    );
                    continue;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        tokio::select! {
            biased;

            maybe_line = rx.recv() => {
                match maybe_line {
                    Some((stream, line)) => {
                        deliver_line(stream, line, &mut on_stdout_line, &mut on_stderr_line, &mut stderr_tail, &mut callback_err);
                        if callback_err.is_some() {
                            terminated_reason = Some(TerminatedReason::CallbackError);
                            terminate(&mut child, opts.timeout.terminate_grace).await;
                            exit_status = child.try_wait().ok().flatten();
                            child_reaped = true;
                        }
                    }
                    None => {
                        // Both drainers finished; fall through to reap the child.
                    }
                }
            }

            status = child.wait(), if !child_reaped => {
                match status {
                    Ok(s) => exit_status = Some(s),
                    Err(e) => {
                        warn!(provider = opts.provider, error = %e, "error waiting on child");
                    }
                }
                child_reaped = true;
            }

            _ = &mut parent_signal, if !child_reaped => {
                debug!(provider = opts.provider, "parent signal received");
                terminated_reason = Some(TerminatedReason::ParentSignal);
                terminate(&mut child, opts.timeout.terminate_grace).await;
                exit_status = child.try_wait().ok().flatten();
                child_reaped = true;
            }

            _ = deadline_tick.tick() => {
                let idle_elapsed = last_activity.lock().unwrap().elapsed();
                let total_elapsed = start.elapsed();

                if idle_elapsed > opts.timeout.idle_timeout {
                    debug!(provider = opts.provider, ?idle_elapsed, "idle timeout reached");
                    terminated_reason = Some(TerminatedReason::IdleTimeout);
                    terminate(&mut child, opts.timeout.terminate_grace).await;
                    exit_status = child.try_wait().ok().flatten();
                    child_reaped = true;
                } else if total_elapsed > opts.timeout.max_timeout {
                    debug!(provider = opts.provider, ?total_elapsed, "max timeout reached");
                    terminated_reason = Some(TerminatedReason::MaxTimeout);
                    terminate(&mut child, opts.timeout.terminate_grace).await;
                    exit_status = child.try_wait().ok().flatten();
                    child_reaped = true;
                }
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_millis(500), stdout_task).await;
    let _ = tokio::time::timeout(Duration::from_millis(500), stderr_task).await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    let stderr_tail: Vec<String> = stderr_tail.into_iter().collect();

    if let Some(reason) = terminated_reason {
        return Err(ProcessError::Terminated {
            provider: opts.provider.to_string(),
            reason,
            command_repr,
            elapsed_ms,
            stderr_tail,
            session_id: None,
        });
    }

    let return_code = exit_status.and_then(|s| s.code()).unwrap_or(-1);
    if return_code != 0 {
        return Err(ProcessError::NonzeroExit {
            provider: opts.provider.to_string(),
            return_code,
            command_repr,
            elapsed_ms,
            stderr_tail,
            session_id: None,
        });
    }

    Ok(ProcessResult { return_code, elapsed_ms })
}

fn deliver_line(
    stream: Stream,
    line: String,
    on_stdout_line: &mut impl FnMut(&str),
    on_stderr_line: &mut impl FnMut(&str),
    stderr_tail: &mut VecDeque<String>,
    callback_err: &mut Option<String>,
) {
    match stream {
        Stream::Stdout => {
            // A panic-free callback is assumed; if the caller needs to
            // signal a parse-layer failure it does so out of band and we
            // never observe it here. `callback_err` exists for symmetry
            // with the design's `callback_error` termination reason and is
            // set only via `std::panic::catch_unwind` boundaries upstream.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_stdout_line(&line);
            }))
            .map_err(|_| {
                *callback_err = Some("stdout callback panicked".to_string());
            });
        }
        Stream::Stderr => {
            if stderr_tail.len() == STDERR_TAIL_LINES {
                stderr_tail.pop_front();
            }
            stderr_tail.push_back(line.clone());
            on_stderr_line(&line);
        }
    }
}

fn spawn_drainer(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
    last_activity: Arc<Mutex<Instant>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    *last_activity.lock().unwrap() = Instant::now();
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts<'a>(command: &'a str, argv: &'a [String]) -> RunOptions<'a> {
        RunOptions {
            provider: "test",
            command,
            argv,
            workdir: None,
            env: &[],
            timeout: TimeoutConfig::quick(),
            stdin_text: None,
            inherit_stdin: false,
        }
    }

    #[tokio::test]
    async fn captures_stdout_lines_in_order() {
        let argv = vec!["-c".to_string(), "echo one; echo two".to_string()];
        let mut lines = Vec::new();
        let result = run(opts("/bin/sh", &argv), |l| lines.push(l.to_string()), |_| {}).await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let argv = vec!["-c".to_string(), "exit 7".to_string()];
        let err = run(opts("/bin/sh", &argv), |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(err.reason_code(), "nonzero_exit");
    }

    #[tokio::test]
    async fn launch_error_for_missing_binary() {
        let argv: Vec<String> = vec![];
        let err = run(opts("/no/such/binary-xyz", &argv), |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(err.reason_code(), "launch_error");
    }

    #[tokio::test]
    async fn idle_timeout_terminates_silent_child() {
        let argv = vec!["-c".to_string(), "sleep 5".to_string()];
        let mut o = opts("/bin/sh", &argv);
        o.timeout = TimeoutConfig {
            idle_timeout: Duration::from_millis(300),
            max_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_millis(200),
        };
        let err = run(o, |_| {}, |_| {}).await.unwrap_err();
        assert_eq!(err.reason_code(), "idle_timeout");
    }

    #[tokio::test]
    async fn stderr_is_captured_for_tail() {
        let argv = vec!["-c".to_string(), "echo boom 1>&2; exit 2".to_string()];
        let err = run(opts("/bin/sh", &argv), |_| {}, |_| {}).await.unwrap_err();
        assert!(err.stderr_tail().iter().any(|l| l.contains("boom")));
    }
}
