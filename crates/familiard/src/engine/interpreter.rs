//! Step interpretation for one workflow run.
//!
//! A run walks the grimoire from a resume path, executing each step inside a window
//! derived from the workflow budget. Every state change goes through the cell's commit
//! protocol, so a run that has been superseded (cancelled, retried elsewhere) stops at
//! its next write without touching the workflow.
//!
//! Step semantics:
//! - agent: waits for an agent slot, spawns the agent in the task worktree, forwards its
//!   events and stores its result under `output` (or the step name). A failed agent
//!   blocks the workflow.
//! - script: runs the command in the worktree and stores `{success, failed, exit_code,
//!   output}` under the step name. `on_fail` decides between continuing and blocking;
//!   `on_success: exit_loop` ends the enclosing loop.
//! - loop: runs its body until a nested script exits it or `max_iterations` is
//!   reached, then applies `on_max_iterations`.
//! - merge: suspends in `pending_merge` when review is required, otherwise merges the
//!   task branch into the target branch. Conflicts block the workflow.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use familiar_core::events::{
    AgentCompletedPayload, AgentFailedPayload, AgentOutputPayload, AgentSpawnedPayload,
    EventPayload, LoopCapHitPayload, QuestionAskedPayload, WorkflowCompletedPayload,
    WorkflowStepFinishedPayload, WorkflowStepStartedPayload, WorktreeCreatedPayload,
};
use familiar_core::grimoire::{
    AgentStep, LoopStep, MergeStep, OnFail, OnMaxIterations, OnSuccess, ScriptStep,
};
use familiar_core::prompt::build_agent_prompt;
use familiar_core::{
    AgentResult, BlockReason, Grimoire, LoopProgress, Step, StepRecord, StepStatus, Workflow,
    WorkflowStatus,
};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::WorkflowCell;
use super::{Inner, RunPlan};
use crate::agent::{AgentConfig, AgentEvent};
use crate::script::run_script;
use crate::timeout::{Interrupted, StepContext, TimeoutCause, TimeoutError, TimeoutManager};
use crate::worktree::MergeOutcome;

/// What the walker does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    /// Leave the innermost enclosing loop.
    ExitLoop,
    /// Stop this run. The workflow state has already been written (or the run was
    /// superseded).
    Halt,
}

#[derive(Debug)]
enum AgentRun {
    Exited(AgentResult),
    SpawnFailed(String),
    /// The event stream closed without an exit event.
    Lost,
    Interrupted,
}

pub(super) async fn run(
    inner: Arc<Inner>,
    cell: Arc<WorkflowCell>,
    generation: u64,
    token: CancellationToken,
    plan: RunPlan,
) {
    let task_id = cell.snapshot().task_id;
    let grimoire = match inner.grimoire_for(&cell) {
        Ok(grimoire) => grimoire,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "cannot load grimoire for run");
            inner
                .commit(&cell, generation, |wf| {
                    wf.block(BlockReason::Setup {
                        message: format!("cannot load grimoire: {e}"),
                    });
                })
                .await;
            return;
        }
    };

    let budget = grimoire
        .timeout
        .unwrap_or(inner.settings.workflow_timeout);
    let timeouts = TimeoutManager::with_parent(budget, &token);
    debug!(task_id = %task_id, resume = ?plan.resume, budget_secs = budget.as_secs(), "run starting");

    let run = Run {
        inner,
        cell,
        generation,
        task_id,
        grimoire: Arc::clone(&grimoire),
        approved: Mutex::new(plan.approved_merge.then(|| plan.resume.clone())),
    };

    if !run.ensure_worktree(timeouts.root(), &plan.resume).await {
        return;
    }
    match run
        .walk(&grimoire.steps, &[], &plan.resume, timeouts.root(), false)
        .await
    {
        Flow::Next | Flow::ExitLoop => run.complete().await,
        Flow::Halt => debug!(task_id = %run.task_id, "run halted"),
    }
}

struct Run {
    inner: Arc<Inner>,
    cell: Arc<WorkflowCell>,
    generation: u64,
    task_id: String,
    grimoire: Arc<Grimoire>,
    /// Merge step approved for this run; consumed when reached.
    approved: Mutex<Option<Vec<usize>>>,
}

impl Run {
    async fn commit(&self, change: impl FnOnce(&mut Workflow)) -> Option<Workflow> {
        self.inner.commit(&self.cell, self.generation, change).await
    }

    async fn emit(&self, payload: EventPayload) {
        self.inner.deps.bus.emit(payload).await;
    }

    fn take_approval(&self, path: &[usize]) -> bool {
        let mut approved = self.approved.lock().unwrap_or_else(PoisonError::into_inner);
        if approved.as_deref() == Some(path) {
            approved.take();
            return true;
        }
        false
    }

    async fn block(&self, path: &[usize], reason: BlockReason) -> Flow {
        warn!(task_id = %self.task_id, reason = %reason.describe(), "workflow blocked");
        let name = self.grimoire.step_at(path).map(|s| s.name().to_string());
        self.commit(|wf| {
            if !path.is_empty() {
                wf.current_step = path.to_vec();
                wf.current_step_name = name;
            }
            wf.block(reason);
        })
        .await;
        Flow::Halt
    }

    async fn block_timeout(&self, step: &str, path: &[usize], cause: TimeoutCause) -> Flow {
        let step = step.to_string();
        let reason = match cause {
            TimeoutCause::Step => BlockReason::StepTimeout { step },
            TimeoutCause::Workflow => BlockReason::WorkflowTimeout { step },
        };
        self.block(path, reason).await
    }

    /// Record a step result. Returns false when the run has been superseded.
    async fn finish(
        &self,
        step: &Step,
        status: StepStatus,
        exit_code: Option<i32>,
        started: Option<Instant>,
        error: Option<String>,
        output: Option<(String, Value)>,
    ) -> bool {
        let duration_ms = started.map_or(0, |s| s.elapsed().as_millis() as u64);
        let record = StepRecord {
            name: step.name().to_string(),
            kind: step.kind(),
            status,
            exit_code,
            duration_ms,
            error,
            finished_at: Utc::now(),
        };
        let committed = self
            .commit(|wf| {
                if let Some((key, value)) = output {
                    wf.outputs.insert(key, value);
                }
                if status != StepStatus::Skipped {
                    wf.previous = Some(record.clone());
                }
                wf.step_results.insert(record.name.clone(), record.clone());
            })
            .await
            .is_some();
        if committed {
            info!(
                task_id = %self.task_id,
                step = %record.name,
                status = status.as_str(),
                exit_code = ?exit_code,
                duration_ms,
                "step finished"
            );
            self.emit(EventPayload::WorkflowStepFinished(WorkflowStepFinishedPayload {
                task_id: self.task_id.clone(),
                step: record.name,
                status,
                exit_code,
                duration_ms,
            }))
            .await;
        }
        committed
    }

    async fn interrupted(
        &self,
        step: &Step,
        path: &[usize],
        started: Instant,
        why: Interrupted,
    ) -> Flow {
        match why {
            Interrupted::Cancelled => {
                self.finish(
                    step,
                    StepStatus::Cancelled,
                    None,
                    Some(started),
                    Some("cancelled".to_string()),
                    None,
                )
                .await;
                Flow::Halt
            }
            Interrupted::TimedOut(cause) => {
                let committed = self
                    .finish(
                        step,
                        StepStatus::TimedOut,
                        None,
                        Some(started),
                        Some("timed out".to_string()),
                        None,
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                self.block_timeout(step.name(), path, cause).await
            }
        }
    }

    /// Make sure the task worktree exists. Blocks the workflow and returns false when it
    /// cannot be created.
    async fn ensure_worktree(&self, root: &StepContext, resume: &[usize]) -> bool {
        let worktrees = Arc::clone(&self.inner.deps.worktrees);
        let existed = worktrees.path_for(&self.task_id).exists();
        match root.run(worktrees.create_for_task(&self.task_id)).await {
            Ok(Ok(info)) => {
                let path = info.path.clone();
                let branch = info.branch.clone().unwrap_or_else(|| worktrees.branch_for(&self.task_id));
                let committed = {
                    let (path, branch) = (path.clone(), branch.clone());
                    self.commit(|wf| {
                        wf.worktree_path = Some(path);
                        wf.branch = Some(branch);
                    })
                    .await
                    .is_some()
                };
                if committed && !existed {
                    self.emit(EventPayload::WorktreeCreated(WorktreeCreatedPayload {
                        task_id: self.task_id.clone(),
                        worktree_path: path,
                        branch,
                    }))
                    .await;
                }
                committed
            }
            Ok(Err(e)) => {
                self.block(
                    resume,
                    BlockReason::Setup {
                        message: format!("worktree creation failed: {e}"),
                    },
                )
                .await;
                false
            }
            Err(Interrupted::Cancelled) => false,
            Err(Interrupted::TimedOut(_)) => {
                self.block(
                    resume,
                    BlockReason::Setup {
                        message: "workflow budget elapsed while creating the worktree".to_string(),
                    },
                )
                .await;
                false
            }
        }
    }

    fn walk<'a>(
        &'a self,
        steps: &'a [Step],
        prefix: &'a [usize],
        resume: &'a [usize],
        ctx: &'a StepContext,
        in_loop: bool,
    ) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            let (start, mut nested) = match resume.split_first() {
                Some((first, rest)) => (*first, rest),
                None => (0, &[][..]),
            };
            for (index, step) in steps.iter().enumerate().skip(start) {
                let mut path = prefix.to_vec();
                path.push(index);
                let flow = self.step(step, &path, nested, ctx, in_loop).await;
                nested = &[];
                if flow != Flow::Next {
                    return flow;
                }
            }
            Flow::Next
        })
    }

    async fn step(
        &self,
        step: &Step,
        path: &[usize],
        nested: &[usize],
        ctx: &StepContext,
        in_loop: bool,
    ) -> Flow {
        let name = step.name();
        if let Some(cause) = ctx.check_timeout() {
            return self.block_timeout(name, path, cause).await;
        }
        if ctx.is_cancelled() {
            return Flow::Halt;
        }

        // A loop resumed mid-body already passed its condition.
        if nested.is_empty() {
            if let Some(condition) = step.when() {
                if !condition.evaluate(&self.cell.snapshot().context()) {
                    info!(task_id = %self.task_id, step = name, "condition is false; skipping");
                    let committed = self
                        .finish(step, StepStatus::Skipped, None, None, None, None)
                        .await;
                    return if committed { Flow::Next } else { Flow::Halt };
                }
            }
        }

        let marked = self
            .commit(|wf| {
                wf.current_step = path.to_vec();
                wf.current_step_name = Some(name.to_string());
            })
            .await;
        if marked.is_none() {
            return Flow::Halt;
        }
        info!(task_id = %self.task_id, step = name, kind = step.kind().as_str(), path = ?path, "step started");
        self.emit(EventPayload::WorkflowStepStarted(WorkflowStepStartedPayload {
            task_id: self.task_id.clone(),
            step: name.to_string(),
            kind: step.kind(),
            path: path.to_vec(),
        }))
        .await;

        match step {
            Step::Agent(agent) => self.agent_step(step, agent, path, ctx).await,
            Step::Script(script) => self.script_step(step, script, path, ctx, in_loop).await,
            Step::Loop(looped) => self.loop_step(step, looped, path, nested, ctx).await,
            Step::Merge(merge) => self.merge_step(step, merge, path, ctx).await,
        }
    }

    /// Agent step invocation id, e.g. `T1/implement` or `T1/test-loop/2/fix-tests`.
    fn step_task_id(&self, path: &[usize], workflow: &Workflow) -> String {
        let mut parts = vec![self.task_id.clone()];
        for depth in 1..=path.len() {
            let Some(step) = self.grimoire.step_at(&path[..depth]) else {
                break;
            };
            parts.push(step.name().to_string());
            if depth < path.len() && matches!(step, Step::Loop(_)) {
                let iteration = workflow
                    .loop_iterations
                    .get(step.name())
                    .map_or(0, |p| p.iterations);
                parts.push(iteration.to_string());
            }
        }
        parts.join("/")
    }

    async fn agent_step(
        &self,
        step: &Step,
        agent: &AgentStep,
        path: &[usize],
        ctx: &StepContext,
    ) -> Flow {
        let name = step.name();
        let scope = match ctx.step_context(name, step.timeout()) {
            Ok(scope) => scope,
            Err(TimeoutError::DeadlineElapsed { cause, .. }) => {
                return self.block_timeout(name, path, cause).await;
            }
        };
        let started = Instant::now();

        let spell = match self.inner.deps.loader.resolve_spell(&agent.spell) {
            Ok(spell) => spell,
            Err(e) => return self.agent_failed(step, path, started, None, e.to_string()).await,
        };
        let workflow = self.cell.snapshot();
        let Some(worktree) = workflow.worktree_path.clone() else {
            return self
                .agent_failed(step, path, started, None, "task has no worktree".to_string())
                .await;
        };
        let config = AgentConfig {
            task_id: self.task_id.clone(),
            step_task_id: self.step_task_id(path, &workflow),
            worktree: PathBuf::from(worktree),
            prompt: build_agent_prompt(&spell, &agent.input, &workflow.context()),
        };

        let outcome = match scope.run(self.drive_agent(config, scope.token())).await {
            Ok(AgentRun::Interrupted) => Err(scope.interruption()),
            other => other,
        };
        match outcome {
            Ok(AgentRun::Exited(result)) => {
                let key = agent.output.clone().unwrap_or_else(|| name.to_string());
                let value = result.to_context();
                if result.success {
                    let committed = self
                        .finish(
                            step,
                            StepStatus::Succeeded,
                            result.exit_code,
                            Some(started),
                            None,
                            Some((key, value)),
                        )
                        .await;
                    return if committed { Flow::Next } else { Flow::Halt };
                }
                let message = describe_agent_failure(&result);
                let committed = self
                    .finish(
                        step,
                        StepStatus::Failed,
                        result.exit_code,
                        Some(started),
                        Some(message.clone()),
                        Some((key, value)),
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                self.block(
                    path,
                    BlockReason::AgentFailed {
                        step: name.to_string(),
                        message,
                    },
                )
                .await
            }
            Ok(AgentRun::SpawnFailed(message)) => {
                self.agent_failed(step, path, started, None, message).await
            }
            Ok(AgentRun::Lost) => {
                self.agent_failed(
                    step,
                    path,
                    started,
                    None,
                    "agent output ended without an exit status".to_string(),
                )
                .await
            }
            Ok(AgentRun::Interrupted) => Flow::Halt,
            Err(why) => self.interrupted(step, path, started, why).await,
        }
    }

    async fn agent_failed(
        &self,
        step: &Step,
        path: &[usize],
        started: Instant,
        exit_code: Option<i32>,
        message: String,
    ) -> Flow {
        let committed = self
            .finish(
                step,
                StepStatus::Failed,
                exit_code,
                Some(started),
                Some(message.clone()),
                None,
            )
            .await;
        if !committed {
            return Flow::Halt;
        }
        self.block(
            path,
            BlockReason::AgentFailed {
                step: step.name().to_string(),
                message,
            },
        )
        .await
    }

    /// Hold a slot, spawn the agent and forward its events until it exits. Cancelling
    /// `token` terminates the agent; the exit is still awaited.
    async fn drive_agent(&self, config: AgentConfig, token: &CancellationToken) -> AgentRun {
        let slots = &self.inner.deps.slots;
        let slot = tokio::select! {
            slot = slots.acquire() => match slot {
                Ok(slot) => slot,
                Err(e) => return AgentRun::SpawnFailed(e.to_string()),
            },
            () = token.cancelled() => return AgentRun::Interrupted,
        };
        debug!(task_id = %self.task_id, in_use = slots.in_use(), capacity = slots.capacity(), "agent slot acquired");

        let agents = &self.inner.deps.agents;
        let step_task_id = config.step_task_id.clone();
        let mut spawned = match agents.spawn(config).await {
            Ok(spawned) => spawned,
            Err(e) => return AgentRun::SpawnFailed(e.to_string()),
        };

        let mut terminating = false;
        let result = loop {
            tokio::select! {
                event = spawned.events.recv() => match event {
                    Some(event) => {
                        if let Some(result) = self.forward(event, &step_task_id).await {
                            break Some(result);
                        }
                    }
                    None => break None,
                },
                () = token.cancelled(), if !terminating => {
                    terminating = true;
                    if let Err(e) = agents.terminate(&self.task_id, "step interrupted").await {
                        debug!(task_id = %self.task_id, error = %e, "agent already gone");
                    }
                }
            }
        };
        drop(slot);
        match result {
            Some(result) => AgentRun::Exited(result),
            None => AgentRun::Lost,
        }
    }

    /// Publish an agent event. Returns the result once the agent has exited.
    async fn forward(&self, event: AgentEvent, step_task_id: &str) -> Option<AgentResult> {
        let task_id = self.task_id.clone();
        let step_task_id = step_task_id.to_string();
        match event {
            AgentEvent::Spawned { pid, command } => {
                self.emit(EventPayload::AgentSpawned(AgentSpawnedPayload {
                    task_id,
                    step_task_id,
                    pid,
                    command,
                }))
                .await;
                None
            }
            AgentEvent::Output { stream, line } => {
                self.emit(EventPayload::AgentOutput(AgentOutputPayload {
                    task_id,
                    step_task_id,
                    stream,
                    line,
                }))
                .await;
                None
            }
            AgentEvent::Question(question) => {
                info!(task_id = %task_id, question_id = %question.id, kind = question.question_type.as_str(), "agent asked a question");
                self.emit(EventPayload::QuestionAsked(QuestionAskedPayload { question }))
                    .await;
                None
            }
            AgentEvent::Exited(result) => {
                let payload = if result.success {
                    EventPayload::AgentCompleted(AgentCompletedPayload {
                        task_id,
                        step_task_id,
                        result: result.clone(),
                    })
                } else {
                    EventPayload::AgentFailed(AgentFailedPayload {
                        task_id,
                        step_task_id,
                        exit_code: result.exit_code,
                        error: describe_agent_failure(&result),
                    })
                };
                self.emit(payload).await;
                Some(result)
            }
        }
    }

    async fn script_step(
        &self,
        step: &Step,
        script: &ScriptStep,
        path: &[usize],
        ctx: &StepContext,
        in_loop: bool,
    ) -> Flow {
        let name = step.name();
        let scope = match ctx.step_context(name, step.timeout()) {
            Ok(scope) => scope,
            Err(TimeoutError::DeadlineElapsed { cause, .. }) => {
                return self.block_timeout(name, path, cause).await;
            }
        };
        let started = Instant::now();
        let Some(worktree) = self.cell.snapshot().worktree_path else {
            return self
                .block(
                    path,
                    BlockReason::Setup {
                        message: "task has no worktree".to_string(),
                    },
                )
                .await;
        };

        let env = [
            ("FAMILIAR_TASK_ID", self.task_id.as_str()),
            ("FAMILIAR_STEP", name),
            ("FAMILIAR_WORKTREE", worktree.as_str()),
        ];
        let outcome = scope
            .run(run_script(
                &script.command,
                Path::new(&worktree),
                &env,
                scope.token(),
                self.inner.settings.script_grace,
            ))
            .await;
        let outcome = match outcome {
            Ok(Ok(result)) if result.cancelled => Err(scope.interruption()),
            other => other,
        };

        match outcome {
            Ok(Ok(result)) => {
                let success = result.success();
                let status = if success {
                    StepStatus::Succeeded
                } else {
                    StepStatus::Failed
                };
                let error = (!success).then(|| match result.exit_code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                });
                let committed = self
                    .finish(
                        step,
                        status,
                        result.exit_code,
                        Some(started),
                        error,
                        Some((name.to_string(), result.to_output())),
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                if success {
                    if in_loop && script.on_success == Some(OnSuccess::ExitLoop) {
                        info!(task_id = %self.task_id, step = name, "script succeeded; leaving loop");
                        return Flow::ExitLoop;
                    }
                    return Flow::Next;
                }
                match script.on_fail {
                    OnFail::Continue => {
                        info!(task_id = %self.task_id, step = name, exit_code = ?result.exit_code, "script failed; continuing");
                        Flow::Next
                    }
                    OnFail::Block => {
                        self.block(
                            path,
                            BlockReason::ScriptFailed {
                                step: name.to_string(),
                                exit_code: result.exit_code,
                            },
                        )
                        .await
                    }
                }
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                let output = json!({
                    "success": false,
                    "failed": true,
                    "exit_code": null,
                    "output": message,
                });
                let committed = self
                    .finish(
                        step,
                        StepStatus::Failed,
                        None,
                        Some(started),
                        Some(message.clone()),
                        Some((name.to_string(), output)),
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                match script.on_fail {
                    OnFail::Continue => Flow::Next,
                    OnFail::Block => {
                        self.block(
                            path,
                            BlockReason::Setup {
                                message: format!("script '{name}' could not start: {message}"),
                            },
                        )
                        .await
                    }
                }
            }
            Err(why) => self.interrupted(step, path, started, why).await,
        }
    }

    async fn loop_step(
        &self,
        step: &Step,
        looped: &LoopStep,
        path: &[usize],
        nested: &[usize],
        ctx: &StepContext,
    ) -> Flow {
        let name = step.name();
        // Without an explicit timeout the loop shares its parent's window.
        let scope = match looped.common.timeout {
            Some(_) => ctx.step_context(name, step.timeout()),
            None => ctx.inherit(name),
        };
        let scope = match scope {
            Ok(scope) => scope,
            Err(TimeoutError::DeadlineElapsed { cause, .. }) => {
                return self.block_timeout(name, path, cause).await;
            }
        };
        let started = Instant::now();

        let mut resume = nested;
        let mut progress = if resume.is_empty() {
            LoopProgress::default()
        } else {
            self.cell
                .snapshot()
                .loop_iterations
                .get(name)
                .copied()
                .unwrap_or_default()
        };

        loop {
            if resume.is_empty() {
                if progress.iterations >= looped.max_iterations {
                    break;
                }
                progress.iterations += 1;
                let current = progress;
                let committed = self
                    .commit(|wf| {
                        wf.loop_iterations.insert(name.to_string(), current);
                    })
                    .await;
                if committed.is_none() {
                    return Flow::Halt;
                }
                info!(
                    task_id = %self.task_id,
                    step = name,
                    iteration = progress.iterations,
                    max = looped.max_iterations,
                    "loop iteration"
                );
            }

            let iteration = match scope.inherit(&format!("{name}#{}", progress.iterations)) {
                Ok(iteration) => iteration,
                Err(TimeoutError::DeadlineElapsed { cause, .. }) => {
                    return self.block_timeout(name, path, cause).await;
                }
            };
            match self
                .walk(&looped.steps, path, resume, &iteration, true)
                .await
            {
                Flow::Next => {}
                Flow::ExitLoop => {
                    let committed = self
                        .finish(step, StepStatus::Succeeded, None, Some(started), None, None)
                        .await;
                    return if committed { Flow::Next } else { Flow::Halt };
                }
                Flow::Halt => return Flow::Halt,
            }
            resume = &[];
        }

        let iterations = progress.iterations;
        warn!(
            task_id = %self.task_id,
            step = name,
            iterations,
            action = ?looped.on_max_iterations,
            "loop reached max iterations"
        );
        self.emit(EventPayload::LoopCapHit(LoopCapHitPayload {
            task_id: self.task_id.clone(),
            step: name.to_string(),
            iterations,
            action: looped.on_max_iterations,
        }))
        .await;

        match looped.on_max_iterations {
            OnMaxIterations::Block => {
                let committed = self
                    .finish(
                        step,
                        StepStatus::Failed,
                        None,
                        Some(started),
                        Some(format!("max iterations ({iterations}) reached")),
                        None,
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                self.block(
                    path,
                    BlockReason::MaxIterations {
                        step: name.to_string(),
                        iterations,
                    },
                )
                .await
            }
            OnMaxIterations::Exit | OnMaxIterations::Continue => {
                progress.cap_hit = looped.on_max_iterations == OnMaxIterations::Continue;
                let current = progress;
                let committed = self
                    .commit(|wf| {
                        wf.loop_iterations.insert(name.to_string(), current);
                    })
                    .await;
                if committed.is_none() {
                    return Flow::Halt;
                }
                let committed = self
                    .finish(step, StepStatus::Succeeded, None, Some(started), None, None)
                    .await;
                if committed {
                    Flow::Next
                } else {
                    Flow::Halt
                }
            }
        }
    }

    async fn merge_step(
        &self,
        step: &Step,
        merge: &MergeStep,
        path: &[usize],
        ctx: &StepContext,
    ) -> Flow {
        let name = step.name();
        if merge.require_review && !self.take_approval(path) {
            info!(task_id = %self.task_id, step = name, "merge awaiting review");
            self.commit(|wf| wf.set_status(WorkflowStatus::PendingMerge))
                .await;
            return Flow::Halt;
        }

        let scope = match ctx.step_context(name, step.timeout()) {
            Ok(scope) => scope,
            Err(TimeoutError::DeadlineElapsed { cause, .. }) => {
                return self.block_timeout(name, path, cause).await;
            }
        };
        let started = Instant::now();
        let worktrees = Arc::clone(&self.inner.deps.worktrees);
        let target = worktrees.settings().target_branch.clone();

        match scope.run(worktrees.merge_to_feature(&self.task_id)).await {
            Ok(Ok(MergeOutcome::Merged { commit })) => {
                let output = json!({ "merged": true, "commit": commit, "target": target });
                let merged = commit.clone();
                if self
                    .commit(|wf| wf.merge_commit = Some(merged))
                    .await
                    .is_none()
                {
                    return Flow::Halt;
                }
                let committed = self
                    .finish(
                        step,
                        StepStatus::Succeeded,
                        None,
                        Some(started),
                        None,
                        Some((name.to_string(), output)),
                    )
                    .await;
                if committed {
                    Flow::Next
                } else {
                    Flow::Halt
                }
            }
            Ok(Ok(MergeOutcome::Conflict { files })) => {
                let output = json!({ "merged": false, "conflicts": files, "target": target });
                let committed = self
                    .finish(
                        step,
                        StepStatus::Failed,
                        None,
                        Some(started),
                        Some(format!("conflict in {} file(s)", files.len())),
                        Some((name.to_string(), output)),
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                self.block(
                    path,
                    BlockReason::MergeConflict {
                        step: name.to_string(),
                        files,
                    },
                )
                .await
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                let committed = self
                    .finish(
                        step,
                        StepStatus::Failed,
                        None,
                        Some(started),
                        Some(message.clone()),
                        None,
                    )
                    .await;
                if !committed {
                    return Flow::Halt;
                }
                self.block(
                    path,
                    BlockReason::MergeFailed {
                        step: name.to_string(),
                        message,
                    },
                )
                .await
            }
            Err(why) => self.interrupted(step, path, started, why).await,
        }
    }

    /// Finish the workflow: completed status, worktree cleanup and question cleanup.
    async fn complete(&self) {
        let completed = self
            .commit(|wf| {
                wf.current_step_name = None;
                wf.error = None;
                wf.block_reason = None;
                wf.set_status(WorkflowStatus::Completed);
            })
            .await;
        let Some(workflow) = completed else {
            return;
        };
        info!(task_id = %self.task_id, merge_commit = ?workflow.merge_commit, "workflow completed");
        self.emit(EventPayload::WorkflowCompleted(WorkflowCompletedPayload {
            task_id: self.task_id.clone(),
            merge_commit: workflow.merge_commit.clone(),
        }))
        .await;

        if let Err(e) = self.inner.cleanup_worktree(&self.task_id, false).await {
            warn!(task_id = %self.task_id, error = %e, "worktree cleanup failed");
        }
        self.inner.clear_questions(&self.task_id).await;
    }
}

fn describe_agent_failure(result: &AgentResult) -> String {
    if let Some(reason) = &result.terminated {
        return format!("terminated: {reason}");
    }
    match result.exit_code {
        Some(0) if !result.completion_found => {
            "exited without reporting completion".to_string()
        }
        Some(code) => format!("exited with code {code}"),
        None => "killed by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: Option<i32>, completion_found: bool) -> AgentResult {
        AgentResult {
            success: exit_code == Some(0) && completion_found,
            exit_code,
            completion_found,
            files_changed: Vec::new(),
            summary: String::new(),
            duration_ms: 1,
            terminated: None,
        }
    }

    #[test]
    fn agent_failures_are_described_by_cause() {
        assert_eq!(
            describe_agent_failure(&result(Some(0), false)),
            "exited without reporting completion"
        );
        assert_eq!(describe_agent_failure(&result(Some(2), true)), "exited with code 2");
        assert_eq!(describe_agent_failure(&result(None, false)), "killed by signal");

        let mut stalled = result(None, false);
        stalled.terminated = Some("step interrupted".to_string());
        assert_eq!(describe_agent_failure(&stalled), "terminated: step interrupted");
    }
}
