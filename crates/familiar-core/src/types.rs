//! Core records shared by the daemon, its storage and its HTTP surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::grimoire::StepKind;

/// Unique identifier for questions and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Workflow ---

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    PendingMerge,
    Blocked,
    Cancelled,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::PendingMerge => "pending_merge",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "pending_merge" => Some(Self::PendingMerge),
            "blocked" => Some(Self::Blocked),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }
}

/// Control operations a client may invoke on a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAction {
    Cancel,
    Retry,
    ApproveMerge,
    RejectMerge,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Retry => "retry",
            Self::ApproveMerge => "approve-merge",
            Self::RejectMerge => "reject-merge",
        }
    }

    /// Actions valid in a given status.
    pub fn available(status: WorkflowStatus) -> Vec<Self> {
        match status {
            WorkflowStatus::Running => vec![Self::Cancel],
            WorkflowStatus::PendingMerge => {
                vec![Self::ApproveMerge, Self::RejectMerge, Self::Cancel]
            }
            WorkflowStatus::Blocked => vec![Self::Retry, Self::Cancel],
            WorkflowStatus::Cancelled | WorkflowStatus::Completed => Vec::new(),
        }
    }
}

/// Why a workflow is blocked. Drives the remediation a client offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// The step's own window elapsed.
    StepTimeout { step: String },
    /// The workflow budget elapsed while the step ran.
    WorkflowTimeout { step: String },
    ScriptFailed { step: String, exit_code: Option<i32> },
    AgentFailed { step: String, message: String },
    MergeConflict { step: String, files: Vec<String> },
    /// The merge could not be attempted (dirty tree, git failure).
    MergeFailed { step: String, message: String },
    ReviewRejected { step: String, reason: String },
    MaxIterations { step: String, iterations: u32 },
    /// Worktree creation or another precondition failed before a step could run.
    Setup { message: String },
    /// The daemon restarted while the workflow was running.
    Interrupted,
    /// The interpreter faulted (panic or internal error).
    Fault { message: String },
}

impl BlockReason {
    pub fn describe(&self) -> String {
        match self {
            Self::StepTimeout { step } => format!("step '{step}' timed out"),
            Self::WorkflowTimeout { step } => {
                format!("workflow timeout elapsed during step '{step}'")
            }
            Self::ScriptFailed { step, exit_code } => match exit_code {
                Some(code) => format!("script '{step}' failed with exit code {code}"),
                None => format!("script '{step}' was terminated by a signal"),
            },
            Self::AgentFailed { step, message } => format!("agent '{step}' failed: {message}"),
            Self::MergeConflict { step, files } => {
                format!("merge '{step}' conflicted in {} file(s): {}", files.len(), files.join(", "))
            }
            Self::MergeFailed { step, message } => format!("merge '{step}' failed: {message}"),
            Self::ReviewRejected { reason, .. } => format!("merge rejected: {reason}"),
            Self::MaxIterations { step, iterations } => {
                format!("loop '{step}' reached max iterations ({iterations})")
            }
            Self::Setup { message } => format!("setup failed: {message}"),
            Self::Interrupted => "interrupted by daemon restart".to_string(),
            Self::Fault { message } => format!("workflow fault: {message}"),
        }
    }
}

/// Opaque task record supplied by the upstream tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: String,
}

impl TaskInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of the most recent execution of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl StepRecord {
    /// Shape exposed to `when` expressions as `previous`.
    pub fn to_context(&self) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind.as_str(),
            "status": self.status.as_str(),
            "success": self.status == StepStatus::Succeeded,
            "failed": matches!(self.status, StepStatus::Failed | StepStatus::TimedOut),
            "skipped": self.status == StepStatus::Skipped,
            "exit_code": self.exit_code,
        })
    }
}

/// Iteration progress of a loop step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopProgress {
    pub iterations: u32,
    pub cap_hit: bool,
}

/// A live execution of a grimoire bound to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub task_id: String,
    pub task: TaskInfo,
    pub grimoire_name: String,
    pub status: WorkflowStatus,
    /// Index path of the step being executed or where execution stopped.
    pub current_step: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    /// Captured step outputs by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<StepRecord>,
    #[serde(default)]
    pub loop_iterations: BTreeMap<String, LoopProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Derived from `status`; refreshed on every write.
    #[serde(default)]
    pub available_actions: Vec<ControlAction>,
}

impl Workflow {
    pub fn new(task: TaskInfo, grimoire_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            task,
            grimoire_name: grimoire_name.into(),
            status: WorkflowStatus::Running,
            current_step: vec![0],
            current_step_name: None,
            outputs: BTreeMap::new(),
            step_results: BTreeMap::new(),
            previous: None,
            loop_iterations: BTreeMap::new(),
            worktree_path: None,
            branch: None,
            merge_commit: None,
            error: None,
            block_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            available_actions: ControlAction::available(WorkflowStatus::Running),
        }
    }

    /// Move to a new status, refreshing derived fields.
    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        self.available_actions = ControlAction::available(status);
        if status.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
    }

    /// Transition to `blocked` with a cause.
    pub fn block(&mut self, reason: BlockReason) {
        self.error = Some(reason.describe());
        self.block_reason = Some(reason);
        self.set_status(WorkflowStatus::Blocked);
    }

    pub fn is_action_available(&self, action: ControlAction) -> bool {
        ControlAction::available(self.status).contains(&action)
    }

    /// JSON context for `when` expressions and prompt templates.
    pub fn context(&self) -> Value {
        let outputs: serde_json::Map<String, Value> = self
            .outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let steps: serde_json::Map<String, Value> = self
            .step_results
            .iter()
            .map(|(k, v)| (k.clone(), v.to_context()))
            .collect();
        json!({
            "task": self.task,
            "outputs": outputs,
            "steps": steps,
            "previous": self.previous.as_ref().map_or(Value::Null, StepRecord::to_context),
            "workflow": {
                "task_id": self.task_id,
                "grimoire": self.grimoire_name,
                "worktree_path": self.worktree_path,
                "branch": self.branch,
            },
        })
    }
}

// --- Questions ---

/// Kind of interactive prompt detected in agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Confirmation,
    Choice,
    Permission,
    Clarification,
    Blocked,
    Input,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Choice => "choice",
            Self::Permission => "permission",
            Self::Clarification => "clarification",
            Self::Blocked => "blocked",
            Self::Input => "input",
        }
    }
}

/// A point where an agent needs human input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: Id,
    pub task_id: String,
    /// The step invocation awaiting the answer (e.g. `T1/implement`).
    pub step_task_id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Question {
    pub fn is_pending(&self) -> bool {
        self.answered_at.is_none()
    }
}

// --- Agents ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Persisted record of a spawned agent, used to re-validate the PID after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProcessRecord {
    pub task_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Kernel start time of the process in clock ticks since boot, when available.
    #[serde(default)]
    pub start_ticks: Option<u64>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub worktree_path: String,
}

/// Structured outcome of an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Zero exit code and a completion marker in the output.
    pub success: bool,
    pub exit_code: Option<i32>,
    pub completion_found: bool,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub summary: String,
    pub duration_ms: u64,
    /// Reason the process was terminated, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<String>,
}

impl AgentResult {
    pub fn to_context(&self) -> Value {
        json!({
            "success": self.success,
            "failed": !self.success,
            "exit_code": self.exit_code,
            "files_changed": self.files_changed,
            "summary": self.summary,
        })
    }
}

// --- Worktrees ---

/// A git working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub head: String,
    pub is_main: bool,
    pub is_bare: bool,
}

// --- Events ---

/// A persisted lifecycle event. `seq` is strictly increasing across the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    #[serde(default)]
    pub task_id: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::PendingMerge,
            WorkflowStatus::Blocked,
            WorkflowStatus::Cancelled,
            WorkflowStatus::Completed,
        ] {
            assert_eq!(WorkflowStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
        assert_eq!(WorkflowStatus::parse("paused"), None);
    }

    #[test]
    fn approve_merge_only_in_pending_merge() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::Blocked,
            WorkflowStatus::Cancelled,
            WorkflowStatus::Completed,
        ] {
            assert!(!ControlAction::available(status).contains(&ControlAction::ApproveMerge));
        }
        assert!(ControlAction::available(WorkflowStatus::PendingMerge)
            .contains(&ControlAction::ApproveMerge));
        assert_eq!(
            serde_json::to_string(&ControlAction::ApproveMerge).unwrap(),
            "\"approve-merge\""
        );
    }

    #[test]
    fn block_sets_error_and_actions() {
        let mut wf = Workflow::new(TaskInfo::new("T1"), "default");
        wf.block(BlockReason::ReviewRejected {
            step: "merge".to_string(),
            reason: "not ready".to_string(),
        });
        assert_eq!(wf.status, WorkflowStatus::Blocked);
        assert_eq!(wf.error.as_deref(), Some("merge rejected: not ready"));
        assert_eq!(
            wf.available_actions,
            vec![ControlAction::Retry, ControlAction::Cancel]
        );
        assert!(wf.finished_at.is_none());
    }

    #[test]
    fn context_exposes_previous_step() {
        let mut wf = Workflow::new(TaskInfo::new("T1"), "default");
        wf.previous = Some(StepRecord {
            name: "run-tests".to_string(),
            kind: StepKind::Script,
            status: StepStatus::Failed,
            exit_code: Some(1),
            duration_ms: 10,
            error: None,
            finished_at: Utc::now(),
        });
        let ctx = wf.context();
        assert_eq!(ctx["previous"]["failed"], true);
        assert_eq!(ctx["previous"]["exit_code"], 1);
        assert_eq!(ctx["task"]["id"], "T1");
    }

    #[test]
    fn block_reason_serializes_tagged() {
        let reason = BlockReason::MergeConflict {
            step: "merge".to_string(),
            files: vec!["src/lib.rs".to_string()],
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "merge_conflict");
        assert_eq!(json["files"][0], "src/lib.rs");
    }
}
