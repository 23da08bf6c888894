//! Lifecycle event types for the ordered event stream.
//!
//! Ordering contract: for one agent, `AGENT_SPAWNED` precedes any `AGENT_OUTPUT`,
//! and exactly one of `AGENT_COMPLETED` / `AGENT_FAILED` follows. A workflow emits
//! exactly one terminal event (`WORKFLOW_COMPLETED` or `WORKFLOW_CANCELLED`).

use serde::{Deserialize, Serialize};

use crate::grimoire::{OnMaxIterations, StepKind};
use crate::types::{AgentResult, Id, OutputStream, Question, StepStatus, WorkflowStatus};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AgentSpawned,
    AgentOutput,
    AgentCompleted,
    AgentFailed,
    WorkflowStarted,
    WorkflowStepStarted,
    WorkflowStepFinished,
    WorkflowStatusChanged,
    WorkflowCompleted,
    WorkflowCancelled,
    LoopCapHit,
    QuestionAsked,
    QuestionAnswered,
    WorktreeCreated,
    WorktreeRemoved,
    WorktreeOrphaned,
    RecoveryOutcome,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentSpawned => "AGENT_SPAWNED",
            Self::AgentOutput => "AGENT_OUTPUT",
            Self::AgentCompleted => "AGENT_COMPLETED",
            Self::AgentFailed => "AGENT_FAILED",
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::WorkflowStepStarted => "WORKFLOW_STEP_STARTED",
            Self::WorkflowStepFinished => "WORKFLOW_STEP_FINISHED",
            Self::WorkflowStatusChanged => "WORKFLOW_STATUS_CHANGED",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::WorkflowCancelled => "WORKFLOW_CANCELLED",
            Self::LoopCapHit => "LOOP_CAP_HIT",
            Self::QuestionAsked => "QUESTION_ASKED",
            Self::QuestionAnswered => "QUESTION_ANSWERED",
            Self::WorktreeCreated => "WORKTREE_CREATED",
            Self::WorktreeRemoved => "WORKTREE_REMOVED",
            Self::WorktreeOrphaned => "WORKTREE_ORPHANED",
            Self::RecoveryOutcome => "RECOVERY_OUTCOME",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpawnedPayload {
    pub task_id: String,
    pub step_task_id: String,
    pub pid: u32,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub task_id: String,
    pub step_task_id: String,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCompletedPayload {
    pub task_id: String,
    pub step_task_id: String,
    pub result: AgentResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailedPayload {
    pub task_id: String,
    pub step_task_id: String,
    pub exit_code: Option<i32>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartedPayload {
    pub task_id: String,
    pub grimoire: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepStartedPayload {
    pub task_id: String,
    pub step: String,
    pub kind: StepKind,
    pub path: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepFinishedPayload {
    pub task_id: String,
    pub step: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusChangedPayload {
    pub task_id: String,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCompletedPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCancelledPayload {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCapHitPayload {
    pub task_id: String,
    pub step: String,
    pub iterations: u32,
    pub action: OnMaxIterations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAskedPayload {
    pub question: Question,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAnsweredPayload {
    pub task_id: String,
    pub question_id: Id,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeCreatedPayload {
    pub task_id: String,
    pub worktree_path: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRemovedPayload {
    pub task_id: String,
    pub worktree_path: String,
    pub branch_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeOrphanedPayload {
    pub worktree_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutcomePayload {
    pub task_id: String,
    pub pid: u32,
    /// `alive`, `dead` or `ambiguous`.
    pub verdict: String,
    pub detail: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    AgentSpawned(AgentSpawnedPayload),
    AgentOutput(AgentOutputPayload),
    AgentCompleted(AgentCompletedPayload),
    AgentFailed(AgentFailedPayload),
    WorkflowStarted(WorkflowStartedPayload),
    WorkflowStepStarted(WorkflowStepStartedPayload),
    WorkflowStepFinished(WorkflowStepFinishedPayload),
    WorkflowStatusChanged(WorkflowStatusChangedPayload),
    WorkflowCompleted(WorkflowCompletedPayload),
    WorkflowCancelled(WorkflowCancelledPayload),
    LoopCapHit(LoopCapHitPayload),
    QuestionAsked(QuestionAskedPayload),
    QuestionAnswered(QuestionAnsweredPayload),
    WorktreeCreated(WorktreeCreatedPayload),
    WorktreeRemoved(WorktreeRemovedPayload),
    WorktreeOrphaned(WorktreeOrphanedPayload),
    RecoveryOutcome(RecoveryOutcomePayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AgentSpawned(_) => EventType::AgentSpawned,
            Self::AgentOutput(_) => EventType::AgentOutput,
            Self::AgentCompleted(_) => EventType::AgentCompleted,
            Self::AgentFailed(_) => EventType::AgentFailed,
            Self::WorkflowStarted(_) => EventType::WorkflowStarted,
            Self::WorkflowStepStarted(_) => EventType::WorkflowStepStarted,
            Self::WorkflowStepFinished(_) => EventType::WorkflowStepFinished,
            Self::WorkflowStatusChanged(_) => EventType::WorkflowStatusChanged,
            Self::WorkflowCompleted(_) => EventType::WorkflowCompleted,
            Self::WorkflowCancelled(_) => EventType::WorkflowCancelled,
            Self::LoopCapHit(_) => EventType::LoopCapHit,
            Self::QuestionAsked(_) => EventType::QuestionAsked,
            Self::QuestionAnswered(_) => EventType::QuestionAnswered,
            Self::WorktreeCreated(_) => EventType::WorktreeCreated,
            Self::WorktreeRemoved(_) => EventType::WorktreeRemoved,
            Self::WorktreeOrphaned(_) => EventType::WorktreeOrphaned,
            Self::RecoveryOutcome(_) => EventType::RecoveryOutcome,
        }
    }

    /// Task the event belongs to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::AgentSpawned(p) => Some(&p.task_id),
            Self::AgentOutput(p) => Some(&p.task_id),
            Self::AgentCompleted(p) => Some(&p.task_id),
            Self::AgentFailed(p) => Some(&p.task_id),
            Self::WorkflowStarted(p) => Some(&p.task_id),
            Self::WorkflowStepStarted(p) => Some(&p.task_id),
            Self::WorkflowStepFinished(p) => Some(&p.task_id),
            Self::WorkflowStatusChanged(p) => Some(&p.task_id),
            Self::WorkflowCompleted(p) => Some(&p.task_id),
            Self::WorkflowCancelled(p) => Some(&p.task_id),
            Self::LoopCapHit(p) => Some(&p.task_id),
            Self::QuestionAsked(p) => Some(&p.question.task_id),
            Self::QuestionAnswered(p) => Some(&p.task_id),
            Self::WorktreeCreated(p) => Some(&p.task_id),
            Self::WorktreeRemoved(p) => Some(&p.task_id),
            Self::WorktreeOrphaned(_) => None,
            Self::RecoveryOutcome(p) => Some(&p.task_id),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
