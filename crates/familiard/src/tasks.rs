//! Upstream task tracker integration.
//!
//! The daemon pulls ready tasks from, and mirrors workflow progress to, an external
//! tracker. [`CommandTaskSource`] drives a tracker CLI:
//!
//! - `<cmd> ready --json` prints a JSON array of tasks
//! - `<cmd> update <id> --status <status>` records a status change

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use familiar_core::{TaskInfo, WorkflowStatus};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on a single tracker command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TaskSourceError {
    #[error("task source command is empty")]
    EmptyCommand,
    #[error("failed to run task source: {0}")]
    Io(#[from] std::io::Error),
    #[error("task source `{command}` failed (exit {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("task source `{0}` timed out")]
    Timeout(String),
    #[error("invalid task source output: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskSourceError>;

/// Status vocabulary understood by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    /// Tracker status mirrored for a workflow status, if any.
    pub fn for_workflow(status: WorkflowStatus) -> Option<Self> {
        match status {
            WorkflowStatus::Running => Some(Self::InProgress),
            WorkflowStatus::Blocked => Some(Self::Blocked),
            WorkflowStatus::Completed => Some(Self::Closed),
            WorkflowStatus::PendingMerge | WorkflowStatus::Cancelled => None,
        }
    }
}

#[async_trait]
pub trait TaskSource: Send + Sync + std::fmt::Debug {
    /// Tasks that are ready to be worked on.
    async fn fetch_ready(&self) -> Result<Vec<TaskInfo>>;

    async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;
}

/// Tracker entry as printed by `ready --json`. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct ReadyTask {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "acceptance")]
    acceptance_criteria: String,
}

impl From<ReadyTask> for TaskInfo {
    fn from(task: ReadyTask) -> Self {
        Self {
            id: task.id,
            title: task.title,
            description: task.description,
            acceptance_criteria: task.acceptance_criteria,
        }
    }
}

/// Parse `ready --json` output. Blank output means no ready tasks.
pub fn parse_ready(stdout: &str) -> Result<Vec<TaskInfo>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let tasks: Vec<ReadyTask> = serde_json::from_str(stdout)?;
    Ok(tasks
        .into_iter()
        .filter(|t| !t.id.trim().is_empty())
        .map(TaskInfo::from)
        .collect())
}

#[derive(Debug, Clone)]
pub struct CommandTaskSource {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
}

impl CommandTaskSource {
    /// Build from a command line such as `bd` or `tracker --project x`. Words are split
    /// on whitespace; no shell is involved.
    pub fn new(command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(TaskSourceError::EmptyCommand)?;
        Ok(Self {
            program,
            base_args: words.collect(),
            timeout: COMMAND_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn describe(&self, args: &[&str]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let description = self.describe(args);
        debug!(command = %description, "running task source");

        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| TaskSourceError::Timeout(description.clone()))??;

        if !output.status.success() {
            return Err(TaskSourceError::CommandFailed {
                command: description,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TaskSource for CommandTaskSource {
    async fn fetch_ready(&self) -> Result<Vec<TaskInfo>> {
        let stdout = self.run(&["ready", "--json"]).await?;
        parse_ready(&stdout)
    }

    async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.run(&["update", task_id, "--status", status.as_str()])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A tracker script that logs its arguments and prints a fixed ready list.
    fn fake_tracker(dir: &TempDir) -> String {
        let log = dir.path().join("calls.log");
        let script = dir.path().join("tracker.sh");
        fs::write(
            &script,
            format!(
                r#"echo "$@" >> {log}
case "$1" in
  ready) echo '[{{"id":"T1","title":"Add login","priority":2}},{{"id":"T2"}}]' ;;
  update) if [ "$2" = "missing" ]; then echo "no such task" >&2; exit 4; fi ;;
esac
exit 0
"#,
                log = log.display()
            ),
        )
        .unwrap();
        format!("sh {}", script.display())
    }

    #[test]
    fn maps_workflow_statuses() {
        assert_eq!(
            TaskStatus::for_workflow(WorkflowStatus::Running),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(
            TaskStatus::for_workflow(WorkflowStatus::Completed).map(|s| s.as_str()),
            Some("closed")
        );
        assert_eq!(TaskStatus::for_workflow(WorkflowStatus::PendingMerge), None);
    }

    #[test]
    fn parse_ready_tolerates_blank_and_extra_fields() {
        assert!(parse_ready("  \n").unwrap().is_empty());
        let tasks = parse_ready(r#"[{"id":"T9","title":"x","labels":["a"]},{"id":""}]"#).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "T9");
        assert!(parse_ready("not json").is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandTaskSource::new("   "),
            Err(TaskSourceError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn command_source_fetches_and_updates() {
        let dir = TempDir::new().unwrap();
        let source = CommandTaskSource::new(&fake_tracker(&dir)).unwrap();

        let ready = source.fetch_ready().await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].title, "Add login");

        source
            .update_status("T1", TaskStatus::InProgress)
            .await
            .unwrap();
        let err = source
            .update_status("missing", TaskStatus::Blocked)
            .await
            .unwrap_err();
        match err {
            TaskSourceError::CommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(stderr, "no such task");
            }
            other => panic!("unexpected error: {other}"),
        }

        let calls = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(calls.contains("ready --json"));
        assert!(calls.contains("update T1 --status in_progress"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("slow.sh");
        fs::write(&script, "sleep 5\n").unwrap();
        let source = CommandTaskSource::new(&format!("sh {}", script.display()))
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(
            source.fetch_ready().await,
            Err(TaskSourceError::Timeout(_))
        ));
    }
}
