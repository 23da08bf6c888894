//! Script step execution.
//!
//! Commands run through `sh -c` in the task worktree, in their own process group so
//! cancellation reaches everything the command started.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use familiar_core::OutputStream;
use nix::sys::signal::Signal;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::OutputBuffer;
use crate::procinfo;

/// Lines of combined output kept for the step result.
const OUTPUT_TAIL_LINES: usize = 200;
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Delay between SIGTERM and SIGKILL when a script is cancelled.
pub const SCRIPT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long output is still collected after the script itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to start script: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("script io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// `None` when the script was killed by a signal.
    pub exit_code: Option<i32>,
    /// Tail of combined stdout and stderr.
    pub output: String,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl ScriptOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.cancelled
    }

    /// Value captured under the step's name for later steps.
    pub fn to_output(&self) -> Value {
        json!({
            "success": self.success(),
            "failed": !self.success(),
            "exit_code": self.exit_code,
            "output": self.output,
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).is_err() {
            break;
        }
    }
}

/// Run `command` in `cwd` until it exits or `cancel` fires.
pub async fn run_script(
    command: &str,
    cwd: &Path,
    env: &[(&str, &str)],
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<ScriptOutcome> {
    let started = Instant::now();
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(ScriptError::Spawn)?;
    let pid = child.id().unwrap_or_default();
    debug!(pid, command, cwd = %cwd.display(), "script started");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, OutputStream::Stderr, tx)));
    }

    let mut buffer = OutputBuffer::new(OUTPUT_TAIL_LINES, OUTPUT_TAIL_BYTES);
    let mut cancelled = false;
    let mut kill_at: Option<tokio::time::Instant> = None;
    let mut killed = false;
    let mut lines_open = true;

    let status = loop {
        let kill_deadline = kill_at.unwrap_or_else(|| tokio::time::Instant::now() + grace);
        tokio::select! {
            line = rx.recv(), if lines_open => match line {
                Some((stream, line)) => buffer.push(stream, line),
                None => lines_open = false,
            },
            status = child.wait() => break status?,
            () = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                info!(pid, command, "cancelling script");
                if let Err(e) = procinfo::signal_group(pid, Signal::SIGTERM) {
                    debug!(pid, error = %e, "SIGTERM not delivered");
                }
                kill_at = Some(tokio::time::Instant::now() + grace);
            }
            () = tokio::time::sleep_until(kill_deadline), if kill_at.is_some() && !killed => {
                warn!(pid, command, "script ignored SIGTERM; killing");
                if let Err(e) = procinfo::signal_group(pid, Signal::SIGKILL) {
                    debug!(pid, error = %e, "SIGKILL not delivered");
                }
                killed = true;
            }
        }
    };

    // Background jobs may hold the pipes open; bound the drain.
    let drain = async {
        while let Some((stream, line)) = rx.recv().await {
            buffer.push(stream, line);
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(pid, command, "script output still open after exit; drain cut short");
    }
    for reader in readers {
        reader.abort();
    }

    let output = buffer
        .tail(OUTPUT_TAIL_LINES)
        .into_iter()
        .map(|l| l.line)
        .collect::<Vec<_>>()
        .join("\n");

    Ok(ScriptOutcome {
        exit_code: status.code(),
        output,
        duration_ms: started.elapsed().as_millis() as u64,
        cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run(command: &str, cancel: &CancellationToken) -> ScriptOutcome {
        let dir = TempDir::new().unwrap();
        run_script(
            command,
            dir.path(),
            &[("FAMILIAR_TASK_ID", "T1")],
            cancel,
            Duration::from_millis(200),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let token = CancellationToken::new();
        let ok = run("echo hello; echo oops >&2; echo $FAMILIAR_TASK_ID", &token).await;
        assert!(ok.success());
        assert!(ok.output.contains("hello"));
        assert!(ok.output.contains("oops"));
        assert!(ok.output.contains("T1"));

        let failed = run("echo 'test failed: x'; exit 3", &token).await;
        assert_eq!(failed.exit_code, Some(3));
        assert!(!failed.success());
        let value = failed.to_output();
        assert_eq!(value["failed"], true);
        assert_eq!(value["exit_code"], 3);
        assert_eq!(value["output"], "test failed: x");
    }

    #[tokio::test]
    async fn cancellation_terminates_the_process_group() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let outcome = run("sleep 30 & wait", &token).await;
        assert!(outcome.cancelled);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_job_holding_output_does_not_stall_the_step() {
        let token = CancellationToken::new();
        let started = Instant::now();
        let outcome = run("echo before; sleep 5 & echo after", &token).await;
        assert!(outcome.success());
        assert!(outcome.output.contains("before"));
        assert!(outcome.output.contains("after"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn stubborn_script_is_killed_after_grace() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = run("trap '' TERM; sleep 30", &token).await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code, None);
    }
}
