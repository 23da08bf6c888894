//! Workflow engine.
//!
//! Owns the workflow registry and the control operations (start, cancel, retry,
//! approve/reject merge, answer question). Each workflow is driven by at most one
//! interpreter run at a time; see [`interpreter`] for step semantics and [`state`] for
//! the commit protocol that keeps control operations and the interpreter mutually
//! exclusive.

mod interpreter;
mod state;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use familiar_core::events::{
    EventPayload, QuestionAnsweredPayload, WorkflowCancelledPayload, WorkflowStartedPayload,
    WorkflowStatusChangedPayload, WorktreeRemovedPayload,
};
use familiar_core::{
    BlockReason, ControlAction, Grimoire, GrimoireError, Id, Loader, Question, TaskInfo, Workflow,
    WorkflowStatus,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentProvider, OutputLine};
use crate::events::EventBus;
use crate::questions::{QuestionStore, QuestionStoreError};
use crate::scheduler::AgentSlots;
use crate::script::SCRIPT_GRACE_PERIOD;
use crate::storage::{Storage, StorageError};
use crate::tasks::{TaskSource, TaskStatus};
use crate::worktree::{CleanupReport, WorktreeError, WorktreeManager};
use state::{RunHandle, WorkflowCell};

/// How long a previous run may take to wind down before a new one starts anyway.
const RUN_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("unknown grimoire: {0}")]
    UnknownGrimoire(String),
    #[error("question not found: {0}")]
    QuestionNotFound(String),
    #[error(transparent)]
    Grimoire(GrimoireError),
    #[error("workflow for task {task_id} is already {status}")]
    AlreadyActive {
        task_id: String,
        status: &'static str,
    },
    #[error("cannot {action} workflow {task_id} while it is {status}")]
    InvalidTransition {
        task_id: String,
        action: &'static str,
        status: &'static str,
    },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Questions(QuestionStoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound(_) | Self::UnknownGrimoire(_) | Self::QuestionNotFound(_)
        )
    }

    /// The operation is not valid in the workflow's current state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyActive { .. } | Self::InvalidTransition { .. })
    }

    /// The request itself is malformed.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Grimoire(_))
    }
}

impl From<QuestionStoreError> for EngineError {
    fn from(e: QuestionStoreError) -> Self {
        match e {
            QuestionStoreError::QuestionNotFound(id) => Self::QuestionNotFound(id),
            other => Self::Questions(other),
        }
    }
}

impl From<GrimoireError> for EngineError {
    fn from(e: GrimoireError) -> Self {
        match e {
            GrimoireError::NotFound(name) => Self::UnknownGrimoire(name),
            other => Self::Grimoire(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Collaborators the engine drives.
#[derive(Debug, Clone)]
pub struct EngineDeps {
    pub storage: Arc<Storage>,
    pub bus: Arc<EventBus>,
    pub agents: Arc<dyn AgentProvider>,
    pub worktrees: Arc<WorktreeManager>,
    pub questions: Arc<QuestionStore>,
    pub loader: Arc<Loader>,
    pub slots: Arc<AgentSlots>,
    pub task_source: Option<Arc<dyn TaskSource>>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_grimoire: String,
    /// Workflow budget for grimoires that set none.
    pub workflow_timeout: Duration,
    /// SIGTERM-to-SIGKILL delay for cancelled scripts.
    pub script_grace: Duration,
    /// Bound on writing an answer to an agent.
    pub answer_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_grimoire: "default".to_string(),
            workflow_timeout: Duration::from_secs(60 * 60),
            script_grace: SCRIPT_GRACE_PERIOD,
            answer_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &familiar_core::Config) -> Self {
        Self {
            default_grimoire: config.default_grimoire.clone(),
            workflow_timeout: config.workflow_timeout,
            ..Self::default()
        }
    }
}

/// Where an interpreter run begins.
#[derive(Debug, Clone, Default)]
struct RunPlan {
    /// Index path to resume at; empty starts from the first step.
    resume: Vec<usize>,
    /// The merge step at `resume` has been approved.
    approved_merge: bool,
}

#[derive(Debug)]
struct Inner {
    deps: EngineDeps,
    settings: EngineSettings,
    workflows: Mutex<HashMap<String, Arc<WorkflowCell>>>,
    /// Parent of every run token. Cancelled on daemon shutdown.
    shutdown: CancellationToken,
    mirror: Option<mpsc::UnboundedSender<(String, TaskStatus)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Must be called inside a tokio runtime when a task source is configured.
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        let mirror = deps.task_source.as_ref().map(|source| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(mirror_statuses(Arc::clone(source), rx));
            tx
        });
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                workflows: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                mirror,
            }),
        }
    }

    pub fn deps(&self) -> &EngineDeps {
        &self.inner.deps
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Start a workflow for `task` with the named grimoire (or the default).
    ///
    /// A task has at most one non-terminal workflow; a finished one is replaced.
    pub async fn start(&self, task: TaskInfo, grimoire: Option<&str>) -> Result<Workflow> {
        if task.id.trim().is_empty() {
            return Err(EngineError::Validation("task id must not be empty".to_string()));
        }
        let name = grimoire
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(&self.inner.settings.default_grimoire)
            .to_string();
        let definition = Arc::new(self.inner.deps.loader.load(&name)?);

        let task_id = task.id.clone();
        let (cell, previous_run) = {
            let mut workflows = lock(&self.inner.workflows);
            let previous_run = match workflows.get(&task_id) {
                Some(existing) if !existing.status().is_terminal() => {
                    return Err(EngineError::AlreadyActive {
                        task_id,
                        status: existing.status().as_str(),
                    });
                }
                Some(existing) => existing.current_run(),
                None => None,
            };
            let cell = Arc::new(WorkflowCell::new(
                Workflow::new(task, name.clone()),
                Some(definition),
            ));
            workflows.insert(task_id.clone(), Arc::clone(&cell));
            (cell, previous_run)
        };

        let _control = cell.control.lock().await;
        let workflow = cell.snapshot();
        self.inner.persist(&workflow).await;
        info!(task_id = %task_id, grimoire = %name, "workflow started");
        self.inner
            .deps
            .bus
            .emit(EventPayload::WorkflowStarted(WorkflowStartedPayload {
                task_id: task_id.clone(),
                grimoire: name,
            }))
            .await;
        self.inner.mirror(&task_id, WorkflowStatus::Running);

        Inner::launch(
            &self.inner,
            Arc::clone(&cell),
            cell.generation(),
            RunPlan::default(),
            previous_run,
        );
        Ok(workflow)
    }

    /// Stop the workflow. Its agent and scripts are terminated; the worktree is kept.
    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<Workflow> {
        let cell = self.inner.cell(task_id)?;
        let workflow = {
            let _control = cell.control.lock().await;
            let status = cell.status();
            if status.is_terminal() {
                return Err(invalid(task_id, ControlAction::Cancel, status));
            }
            cell.fence();
            if let Some(run) = cell.current_run() {
                run.token.cancel();
            }
            let workflow = self
                .inner
                .write(&cell, |wf| wf.set_status(WorkflowStatus::Cancelled))
                .await;
            self.inner
                .deps
                .bus
                .emit(EventPayload::WorkflowCancelled(WorkflowCancelledPayload {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                }))
                .await;
            workflow
        };
        info!(task_id, reason, "workflow cancelled");

        // Agents adopted after a restart are not owned by any run.
        if self.inner.deps.agents.is_running(task_id) {
            if let Err(e) = self.inner.deps.agents.terminate(task_id, reason).await {
                debug!(task_id, error = %e, "agent already gone");
            }
        }
        self.inner.clear_questions(task_id).await;
        Ok(workflow)
    }

    /// Resume a blocked workflow at the step that blocked it.
    pub async fn retry(&self, task_id: &str) -> Result<Workflow> {
        let cell = self.inner.cell(task_id)?;
        let _control = cell.control.lock().await;
        let status = cell.status();
        if status != WorkflowStatus::Blocked {
            return Err(invalid(task_id, ControlAction::Retry, status));
        }
        let previous_run = cell.current_run();
        let generation = cell.fence();
        let workflow = self
            .inner
            .write(&cell, |wf| {
                if let Some(BlockReason::MaxIterations { step, .. }) = &wf.block_reason {
                    let step = step.clone();
                    wf.loop_iterations.remove(&step);
                }
                wf.error = None;
                wf.block_reason = None;
                wf.set_status(WorkflowStatus::Running);
            })
            .await;
        info!(task_id, step = ?workflow.current_step_name, "retrying workflow");

        let plan = RunPlan {
            resume: workflow.current_step.clone(),
            approved_merge: false,
        };
        Inner::launch(&self.inner, Arc::clone(&cell), generation, plan, previous_run);
        Ok(workflow)
    }

    /// Perform a merge awaiting review and continue with the following steps.
    pub async fn approve_merge(&self, task_id: &str) -> Result<Workflow> {
        let cell = self.inner.cell(task_id)?;
        let _control = cell.control.lock().await;
        let status = cell.status();
        if status != WorkflowStatus::PendingMerge {
            return Err(invalid(task_id, ControlAction::ApproveMerge, status));
        }
        let previous_run = cell.current_run();
        let generation = cell.fence();
        let workflow = self
            .inner
            .write(&cell, |wf| wf.set_status(WorkflowStatus::Running))
            .await;
        info!(task_id, "merge approved");

        let plan = RunPlan {
            resume: workflow.current_step.clone(),
            approved_merge: true,
        };
        Inner::launch(&self.inner, Arc::clone(&cell), generation, plan, previous_run);
        Ok(workflow)
    }

    /// Decline a merge awaiting review. The workflow blocks with its worktree intact;
    /// retrying re-enters the merge step.
    pub async fn reject_merge(&self, task_id: &str, reason: &str) -> Result<Workflow> {
        let cell = self.inner.cell(task_id)?;
        let _control = cell.control.lock().await;
        let status = cell.status();
        if status != WorkflowStatus::PendingMerge {
            return Err(invalid(task_id, ControlAction::RejectMerge, status));
        }
        cell.fence();
        let reason = match reason.trim() {
            "" => "rejected by reviewer".to_string(),
            r => r.to_string(),
        };
        let workflow = self
            .inner
            .write(&cell, |wf| {
                let step = wf.current_step_name.clone().unwrap_or_default();
                wf.block(BlockReason::ReviewRejected { step, reason });
            })
            .await;
        info!(task_id, "merge rejected");
        Ok(workflow)
    }

    /// Record an answer and deliver it to the agent that asked, if it is still running.
    ///
    /// Answering is idempotent: a question keeps its first answer, and answering an
    /// undelivered question again retries delivery.
    pub async fn answer_question(&self, question_id: &str, answer: &str) -> Result<Question> {
        if answer.trim().is_empty() {
            return Err(EngineError::Validation("answer must not be empty".to_string()));
        }
        let questions = &self.inner.deps.questions;
        let id = Id::from_string(question_id);
        let question = questions.get(&id)?;
        if question.delivered_at.is_some() {
            return Ok(question);
        }
        let question = questions.mark_answered(&id, answer).await?;
        let text = question.answer.clone().unwrap_or_else(|| answer.to_string());
        let task_id = question.task_id.clone();

        let agents = &self.inner.deps.agents;
        let delivery = match agents.running_step(&task_id) {
            Some(step) if step == question.step_task_id => {
                match tokio::time::timeout(
                    self.inner.settings.answer_timeout,
                    agents.respond(&task_id, &text),
                )
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timed out writing answer to agent".to_string()),
                }
            }
            Some(_) => Err("the asking step is no longer running".to_string()),
            None => Err("agent is not running".to_string()),
        };

        let (question, delivered) = match delivery {
            Ok(()) => (questions.mark_delivered(&id).await?, true),
            Err(message) => {
                warn!(task_id = %task_id, question_id, error = %message, "answer not delivered");
                (questions.mark_delivery_failed(&id, &message).await?, false)
            }
        };
        self.inner
            .deps
            .bus
            .emit(EventPayload::QuestionAnswered(QuestionAnsweredPayload {
                task_id,
                question_id: id,
                delivered,
            }))
            .await;
        Ok(question)
    }

    pub fn get(&self, task_id: &str) -> Result<Workflow> {
        Ok(self.inner.cell(task_id)?.snapshot())
    }

    /// Workflows, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<WorkflowStatus>) -> Vec<Workflow> {
        let cells: Vec<Arc<WorkflowCell>> = lock(&self.inner.workflows).values().cloned().collect();
        let mut workflows: Vec<Workflow> = cells
            .iter()
            .map(|c| c.snapshot())
            .filter(|wf| status.map_or(true, |s| wf.status == s))
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        workflows
    }

    /// Pending questions, for one task or across all tasks.
    pub fn pending_questions(&self, task_id: Option<&str>) -> Vec<Question> {
        let questions = &self.inner.deps.questions;
        match task_id {
            Some(task) => questions
                .list_for_task(task)
                .into_iter()
                .filter(Question::is_pending)
                .collect(),
            None => questions.list_pending(),
        }
    }

    /// Tail of the task's current or most recent agent output.
    pub fn output_tail(&self, task_id: &str, lines: usize) -> Result<Vec<OutputLine>> {
        self.inner.cell(task_id)?;
        Ok(self
            .inner
            .deps
            .agents
            .output_tail(task_id, lines)
            .unwrap_or_default())
    }

    /// Remove a finished workflow's worktree. `discard` also deletes an unmerged branch.
    pub async fn cleanup(&self, task_id: &str, discard: bool) -> Result<CleanupReport> {
        let cell = self.inner.cell(task_id)?;
        let _control = cell.control.lock().await;
        let status = cell.status();
        if !status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.to_string(),
                action: "clean up",
                status: status.as_str(),
            });
        }
        let report = self.inner.cleanup_worktree(task_id, discard).await?;
        Ok(report)
    }

    /// Tasks whose worktrees are accounted for by a workflow record.
    pub fn live_tasks(&self) -> HashSet<String> {
        lock(&self.inner.workflows)
            .iter()
            .filter(|(_, cell)| cell.status() != WorkflowStatus::Completed)
            .map(|(task, _)| task.clone())
            .collect()
    }

    /// Load persisted workflows into the registry. Workflows that were running when the
    /// previous daemon stopped are blocked as interrupted; their ids are returned.
    pub async fn rehydrate(&self) -> Result<Vec<String>> {
        let persisted = self.inner.deps.storage.list_workflows(None).await?;
        let mut interrupted = Vec::new();
        for workflow in persisted {
            let task_id = workflow.task_id.clone();
            let running = workflow.status == WorkflowStatus::Running;
            let cell = {
                let mut workflows = lock(&self.inner.workflows);
                if workflows.contains_key(&task_id) {
                    continue;
                }
                let cell = Arc::new(WorkflowCell::new(workflow, None));
                workflows.insert(task_id.clone(), Arc::clone(&cell));
                cell
            };
            if running {
                let _control = cell.control.lock().await;
                self.inner
                    .write(&cell, |wf| wf.block(BlockReason::Interrupted))
                    .await;
                warn!(task_id = %task_id, "workflow interrupted by restart");
                interrupted.push(task_id);
            }
        }
        Ok(interrupted)
    }

    /// Stop all runs without changing workflow status. Running workflows stay `running`
    /// in storage and are reported as interrupted on the next start.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.shutdown.cancel();
        let runs: Vec<RunHandle> = lock(&self.inner.workflows)
            .values()
            .filter_map(|c| c.current_run())
            .collect();
        let all_done = futures_util::future::join_all(runs.iter().map(|r| r.done.cancelled()));
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            warn!("workflow runs still winding down at shutdown");
        }
    }
}

fn invalid(task_id: &str, action: ControlAction, status: WorkflowStatus) -> EngineError {
    EngineError::InvalidTransition {
        task_id: task_id.to_string(),
        action: action.as_str(),
        status: status.as_str(),
    }
}

async fn mirror_statuses(
    source: Arc<dyn TaskSource>,
    mut rx: mpsc::UnboundedReceiver<(String, TaskStatus)>,
) {
    while let Some((task_id, status)) = rx.recv().await {
        match source.update_status(&task_id, status).await {
            Ok(()) => debug!(task_id = %task_id, status = status.as_str(), "mirrored status upstream"),
            Err(e) => {
                warn!(task_id = %task_id, status = status.as_str(), error = %e, "failed to mirror status upstream");
            }
        }
    }
}

impl Inner {
    fn cell(&self, task_id: &str) -> Result<Arc<WorkflowCell>> {
        lock(&self.workflows)
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(task_id.to_string()))
    }

    async fn persist(&self, workflow: &Workflow) {
        if let Err(e) = self.deps.storage.upsert_workflow(workflow).await {
            error!(task_id = %workflow.task_id, error = %e, "failed to persist workflow");
        }
    }

    fn mirror(&self, task_id: &str, status: WorkflowStatus) {
        let (Some(tx), Some(status)) = (&self.mirror, TaskStatus::for_workflow(status)) else {
            return;
        };
        // The worker only stops when the engine is dropped.
        let _ = tx.send((task_id.to_string(), status));
    }

    /// Apply a change under the caller's control lock, persist it and announce any
    /// status change.
    async fn write(&self, cell: &WorkflowCell, change: impl FnOnce(&mut Workflow)) -> Workflow {
        let (before, workflow) = cell.update(change);
        self.persist(&workflow).await;
        if before != workflow.status {
            self.deps
                .bus
                .emit(EventPayload::WorkflowStatusChanged(WorkflowStatusChangedPayload {
                    task_id: workflow.task_id.clone(),
                    from: before,
                    to: workflow.status,
                    error: (workflow.status == WorkflowStatus::Blocked)
                        .then(|| workflow.error.clone())
                        .flatten(),
                }))
                .await;
            self.mirror(&workflow.task_id, workflow.status);
        }
        workflow
    }

    /// Apply a change on behalf of an interpreter run. Rejected (returns `None`) once
    /// the run has been superseded.
    async fn commit(
        &self,
        cell: &WorkflowCell,
        generation: u64,
        change: impl FnOnce(&mut Workflow),
    ) -> Option<Workflow> {
        let _control = cell.control.lock().await;
        if !cell.is_current(generation) {
            return None;
        }
        Some(self.write(cell, change).await)
    }

    async fn clear_questions(&self, task_id: &str) {
        match self.deps.questions.clear_task(task_id).await {
            Ok(0) => {}
            Ok(n) => debug!(task_id, cleared = n, "cleared task questions"),
            Err(e) => warn!(task_id, error = %e, "failed to clear task questions"),
        }
    }

    async fn cleanup_worktree(&self, task_id: &str, discard: bool) -> Result<CleanupReport> {
        let report = self.deps.worktrees.cleanup_for_task(task_id, discard).await?;
        if report.worktree_removed {
            self.deps
                .bus
                .emit(EventPayload::WorktreeRemoved(WorktreeRemovedPayload {
                    task_id: task_id.to_string(),
                    worktree_path: self.deps.worktrees.path_for(task_id).display().to_string(),
                    branch_deleted: report.branch_deleted,
                }))
                .await;
        }
        Ok(report)
    }

    /// Grimoire for a run, loading it by name after a restart.
    fn grimoire_for(&self, cell: &WorkflowCell) -> Result<Arc<Grimoire>> {
        if let Some(grimoire) = cell.grimoire() {
            return Ok(grimoire);
        }
        let name = cell.snapshot().grimoire_name;
        let grimoire = Arc::new(self.deps.loader.load(&name)?);
        cell.set_grimoire(Arc::clone(&grimoire));
        Ok(grimoire)
    }

    /// Wait for a task's agent to be gone, terminating leftovers from a previous run.
    async fn await_agent_exit(&self, task_id: &str) {
        let agents = &self.deps.agents;
        if !agents.is_running(task_id) {
            return;
        }
        if let Err(e) = agents.terminate(task_id, "superseded by a new run").await {
            debug!(task_id, error = %e, "agent already gone");
        }
        let deadline = tokio::time::Instant::now() + RUN_HANDOFF_TIMEOUT;
        while agents.is_running(task_id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Spawn an interpreter run for `cell`. Called with the cell's control lock held.
    fn launch(
        self: &Arc<Self>,
        cell: Arc<WorkflowCell>,
        generation: u64,
        plan: RunPlan,
        previous: Option<RunHandle>,
    ) {
        let token = self.shutdown.child_token();
        let done = CancellationToken::new();
        let handle = RunHandle {
            generation,
            token: token.clone(),
            done: done.clone(),
        };
        // The cell may have been replaced by `start`, in which case `previous` came
        // from the old cell.
        let replaced = cell.replace_run(handle);
        let previous = previous.or(replaced);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = cell.snapshot().task_id;
            if let Some(previous) = previous {
                previous.token.cancel();
                if tokio::time::timeout(RUN_HANDOFF_TIMEOUT, previous.done.cancelled())
                    .await
                    .is_err()
                {
                    warn!(task_id = %task_id, "previous run did not stop in time");
                }
            }
            inner.await_agent_exit(&task_id).await;

            let run = tokio::spawn(interpreter::run(
                Arc::clone(&inner),
                Arc::clone(&cell),
                generation,
                token,
                plan,
            ));
            match run.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!(task_id = %task_id, "workflow interpreter panicked");
                    inner
                        .commit(&cell, generation, |wf| {
                            wf.block(BlockReason::Fault {
                                message: "interpreter panicked".to_string(),
                            });
                        })
                        .await;
                }
                Err(e) => debug!(task_id = %task_id, error = %e, "workflow run aborted"),
            }
            done.cancel();
        });
    }
}
