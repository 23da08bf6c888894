//! End-to-end workflow tests: the engine driving real git worktrees, scripts and a
//! shell-script agent.

mod common;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use async_trait::async_trait;
use common::{git, Harness, COMMITTING_AGENT, SLEEPING_AGENT};
use familiar_core::{AgentProcessRecord, BlockReason, StepStatus, TaskInfo, WorkflowStatus};
use familiard::agent::{self, AgentConfig, AgentError, AgentProvider, OutputLine, SpawnedAgent};
use familiard::engine::{Engine, EngineSettings};
use familiard::tasks::{CommandTaskSource, TaskSource};

const ALWAYS_FAIL: &str = r#"
name: always-fail
description: A check that never passes
steps:
  - name: attempts
    type: loop
    max_iterations: 3
    on_max_iterations: block
    steps:
      - name: check
        type: script
        command: "echo checking; exit 1"
        on_fail: continue
"#;

const SOFT_CAP: &str = r#"
name: soft-cap
description: Tolerates a failing probe, then reports
steps:
  - name: retries
    type: loop
    max_iterations: 2
    on_max_iterations: continue
    steps:
      - name: probe
        type: script
        command: "exit 3"
        on_fail: continue
  - name: report
    type: script
    command: 'echo "task $FAMILIAR_TASK_ID at $FAMILIAR_STEP"'
  - name: recover
    type: script
    command: "echo never"
    when: previous.failed
"#;

const SLOW_STEP: &str = r#"
name: slow-step
description: A script that outlives its own window
steps:
  - name: slow
    type: script
    timeout: 300ms
    command: "sleep 5"
"#;

const SLOW_WORKFLOW: &str = r#"
name: slow-workflow
description: A script that outlives the whole workflow
timeout: 300ms
steps:
  - name: slow
    type: script
    command: "sleep 5"
"#;

const DIVERGING_MERGE: &str = r#"
name: diverging
description: Edits README on the task branch and on main, then merges unreviewed
steps:
  - name: edit
    type: script
    command: |
      echo "task version" > README.md
      git commit -qam "task edit"
      main=$(git worktree list --porcelain | sed -n '1s/^worktree //p')
      echo "main version" > "$main/README.md"
      git -C "$main" commit -qam "main edit"
  - name: merge
    type: merge
    require_review: false
  - name: after
    type: script
    command: "echo never"
"#;

const DIRECT_MERGE: &str = r#"
name: direct
description: Commits a file and merges without review
steps:
  - name: edit
    type: script
    command: |
      echo "extra" > extra.txt
      git add extra.txt
      git commit -qm "add extra"
  - name: merge
    type: merge
    require_review: false
  - name: after
    type: script
    command: "echo merged"
"#;

const EARLY_EXIT: &str = r#"
name: early-exit
description: Leaves the loop as soon as the check passes
steps:
  - name: attempts
    type: loop
    max_iterations: 3
    on_max_iterations: block
    steps:
      - name: check
        type: script
        command: "exit 0"
        on_success: exit_loop
      - name: later
        type: script
        command: "echo never"
  - name: after
    type: script
    command: "echo done"
"#;

/// First pass writes the feature, any later pass writes the fix the tests want.
const FIXING_AGENT: &str = r#"if [ -f feature.txt ]; then
  echo fixed > fixed.txt
else
  echo feature > feature.txt
fi
git add -A
git commit -q -m "agent pass"
echo "<promise>COMPLETE</promise>"
"#;

fn task(id: &str) -> TaskInfo {
    TaskInfo {
        title: format!("Task {id}"),
        ..TaskInfo::new(id)
    }
}

#[tokio::test]
async fn reviewed_merge_lands_on_target_and_cleans_up() {
    let h = Harness::new(COMMITTING_AGENT).await;
    let engine = h.daemon.engine();

    let started = engine.start(task("T1"), Some("quick")).await.unwrap();
    assert_eq!(started.status, WorkflowStatus::Running);

    let pending = h.wait_for("T1", WorkflowStatus::PendingMerge).await;
    assert_eq!(pending.current_step_name.as_deref(), Some("merge"));
    assert_eq!(
        pending.step_results["implement"].status,
        StepStatus::Succeeded
    );
    let worktree = h.worktree("T1");
    assert!(worktree.join("feature.txt").exists());

    engine.approve_merge("T1").await.unwrap();
    let done = h.wait_for("T1", WorkflowStatus::Completed).await;
    assert!(done.merge_commit.is_some());
    assert_eq!(done.outputs["merge"]["merged"], true);

    let merged = git(&h.repo(), &["show", "main:feature.txt"]);
    assert!(merged.starts_with("change from"));
    h.wait_until("worktree removal", || !worktree.exists()).await;

    let events = engine
        .deps()
        .storage
        .list_events_for_task("T1")
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&"WORKFLOW_STARTED"));
    assert!(types.contains(&"WORKTREE_CREATED"));
    assert!(types.contains(&"AGENT_COMPLETED"));
    assert!(types.contains(&"WORKFLOW_COMPLETED"));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn rejected_merge_blocks_and_retry_returns_to_review() {
    let h = Harness::new(COMMITTING_AGENT).await;
    let engine = h.daemon.engine();

    engine.start(task("T2"), Some("quick")).await.unwrap();
    h.wait_for("T2", WorkflowStatus::PendingMerge).await;

    let blocked = engine.reject_merge("T2", "needs tests").await.unwrap();
    assert_eq!(blocked.status, WorkflowStatus::Blocked);
    assert_eq!(
        blocked.block_reason,
        Some(BlockReason::ReviewRejected {
            step: "merge".to_string(),
            reason: "needs tests".to_string(),
        })
    );
    assert!(h.worktree("T2").exists());

    let err = engine.approve_merge("T2").await.unwrap_err();
    assert!(err.is_conflict());

    engine.retry("T2").await.unwrap();
    let pending = h.wait_for("T2", WorkflowStatus::PendingMerge).await;
    assert_eq!(pending.current_step_name.as_deref(), Some("merge"));
    // The agent step is not re-run on retry.
    let spawned = engine
        .deps()
        .storage
        .list_events_for_task("T2")
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "AGENT_SPAWNED")
        .count();
    assert_eq!(spawned, 1);
}

#[tokio::test]
async fn loop_cap_blocks_and_retry_starts_counting_again() {
    let h = Harness::with(COMMITTING_AGENT, &[("always-fail", ALWAYS_FAIL)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T3"), Some("always-fail")).await.unwrap();
    let blocked = h.wait_for("T3", WorkflowStatus::Blocked).await;
    assert_eq!(
        blocked.block_reason,
        Some(BlockReason::MaxIterations {
            step: "attempts".to_string(),
            iterations: 3,
        })
    );
    assert_eq!(blocked.loop_iterations["attempts"].iterations, 3);
    assert_eq!(blocked.step_results["check"].status, StepStatus::Failed);
    assert_eq!(blocked.step_results["check"].exit_code, Some(1));

    engine.retry("T3").await.unwrap();
    let again = h.wait_for("T3", WorkflowStatus::Blocked).await;
    assert_eq!(again.loop_iterations["attempts"].iterations, 3);
    assert_eq!(step_starts(engine, "T3", "check").await, 6);

    let cap_hits = engine
        .deps()
        .storage
        .list_events_for_task("T3")
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "LOOP_CAP_HIT")
        .count();
    assert_eq!(cap_hits, 2);
}

#[tokio::test]
async fn soft_cap_continues_and_when_skips_steps() {
    let h = Harness::with(COMMITTING_AGENT, &[("soft-cap", SOFT_CAP)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T4"), Some("soft-cap")).await.unwrap();
    let done = h.wait_for("T4", WorkflowStatus::Completed).await;

    let progress = done.loop_iterations["retries"];
    assert_eq!(progress.iterations, 2);
    assert!(progress.cap_hit);

    let report = done.outputs["report"]["output"].as_str().unwrap();
    assert!(report.contains("task T4 at report"), "{report}");
    assert_eq!(done.step_results["recover"].status, StepStatus::Skipped);
    // A skipped step does not replace `previous`.
    assert_eq!(done.previous.as_ref().map(|p| p.name.as_str()), Some("report"));
}

#[tokio::test]
async fn cancel_stops_agent_and_keeps_worktree_until_cleanup() {
    let h = Harness::new(SLEEPING_AGENT).await;
    let engine = h.daemon.engine();
    let agents = Arc::clone(&engine.deps().agents);

    engine.start(task("T5"), Some("quick")).await.unwrap();
    h.wait_until("agent to start", || agents.is_running("T5")).await;

    let cancelled = engine.cancel("T5", "changed my mind").await.unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
    h.wait_until("agent to stop", || !agents.is_running("T5")).await;

    // Terminal: nothing moves it any more.
    assert!(engine.retry("T5").await.unwrap_err().is_conflict());
    assert!(engine.cancel("T5", "again").await.unwrap_err().is_conflict());
    assert_eq!(engine.get("T5").unwrap().status, WorkflowStatus::Cancelled);

    assert!(h.worktree("T5").exists());
    let report = engine.cleanup("T5", true).await.unwrap();
    assert!(report.worktree_removed);
    assert!(report.branch_deleted);
    assert!(!h.worktree("T5").exists());
}

#[tokio::test]
async fn answered_question_reaches_the_agent() {
    let agent = r#"echo "Should I use tabs or spaces?"
read answer
echo "answer: $answer"
echo "<promise>COMPLETE</promise>"
"#;
    let h = Harness::new(agent).await;
    let engine = h.daemon.engine();

    engine.start(task("T6"), Some("quick")).await.unwrap();
    h.wait_until("question", || !engine.pending_questions(Some("T6")).is_empty())
        .await;
    let question = engine.pending_questions(Some("T6")).remove(0);
    assert_eq!(question.step_task_id, "T6/implement");

    assert!(engine
        .answer_question(&question.id.to_string(), "  ")
        .await
        .unwrap_err()
        .is_invalid());

    let answered = engine
        .answer_question(&question.id.to_string(), "tabs")
        .await
        .unwrap();
    assert_eq!(answered.answer.as_deref(), Some("tabs"));
    assert!(answered.delivered_at.is_some());

    h.wait_for("T6", WorkflowStatus::PendingMerge).await;
    let tail = engine.output_tail("T6", 10).unwrap();
    assert!(tail.iter().any(|l| l.line == "answer: tabs"));
    assert!(engine.pending_questions(None).is_empty());

    assert!(engine
        .answer_question("no-such-question", "x")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn start_validates_grimoire_and_rejects_duplicates() {
    let h = Harness::new(SLEEPING_AGENT).await;
    let engine = h.daemon.engine();

    assert!(engine
        .start(task("T7"), Some("no-such-grimoire"))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(engine.get("T7").unwrap_err().is_not_found());
    assert!(engine.start(task(""), None).await.unwrap_err().is_invalid());

    engine.start(task("T7"), Some("quick")).await.unwrap();
    assert!(engine
        .start(task("T7"), Some("quick"))
        .await
        .unwrap_err()
        .is_conflict());

    engine.cancel("T7", "test over").await.unwrap();
    // A finished workflow may be replaced by a fresh start.
    let restarted = engine.start(task("T7"), Some("quick")).await.unwrap();
    assert_eq!(restarted.status, WorkflowStatus::Running);
    engine.cancel("T7", "test over").await.unwrap();
}

#[tokio::test]
async fn restart_blocks_interrupted_workflows() {
    let h = Harness::new(SLEEPING_AGENT).await;
    {
        let engine = h.daemon.engine();
        let agents = Arc::clone(&engine.deps().agents);
        engine.start(task("T8"), Some("quick")).await.unwrap();
        h.wait_until("agent to start", || agents.is_running("T8")).await;
        h.daemon.shutdown().await;
    }

    let restarted = h.restart().await;
    let report = restarted.recovery().recover().await.unwrap();
    assert_eq!(report.interrupted, vec!["T8".to_string()]);

    let workflow = restarted.engine().get("T8").unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Blocked);
    assert_eq!(workflow.block_reason, Some(BlockReason::Interrupted));
    // The worktree belongs to a live (blocked) workflow, so it is no orphan.
    assert!(report.orphans.is_empty());
}

#[tokio::test]
async fn ready_tasks_are_started_once() {
    let h = Harness::new(SLEEPING_AGENT).await;
    let engine = h.daemon.engine();

    let script = h.dir.path().join("tracker.sh");
    std::fs::write(
        &script,
        "case \"$1\" in\n  ready) echo '[{\"id\":\"T9\",\"title\":\"From tracker\"}]' ;;\nesac\nexit 0\n",
    )
    .unwrap();
    let source = CommandTaskSource::new(&format!("sh {}", script.display())).unwrap();
    assert_eq!(source.fetch_ready().await.unwrap().len(), 1);

    let started = familiard::start_ready_tasks(engine, &source).await;
    assert_eq!(started, vec!["T9".to_string()]);
    assert_eq!(engine.get("T9").unwrap().task.title, "From tracker");

    assert!(familiard::start_ready_tasks(engine, &source).await.is_empty());
    engine.cancel("T9", "test over").await.unwrap();
}

/// How many times `step` was started for `task_id`, from the event log.
async fn step_starts(engine: &Engine, task_id: &str, step: &str) -> usize {
    engine
        .deps()
        .storage
        .list_events_for_task(task_id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "WORKFLOW_STEP_STARTED")
        .filter(|e| {
            let payload: serde_json::Value = serde_json::from_str(&e.payload_json).unwrap();
            payload["step"] == step
        })
        .count()
}

#[tokio::test]
async fn loop_body_runs_exactly_max_iterations_times() {
    let h = Harness::with(COMMITTING_AGENT, &[("always-fail", ALWAYS_FAIL)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T10"), Some("always-fail")).await.unwrap();
    h.wait_for("T10", WorkflowStatus::Blocked).await;
    assert_eq!(step_starts(engine, "T10", "check").await, 3);
    assert_eq!(step_starts(engine, "T10", "attempts").await, 1);
}

#[tokio::test]
async fn step_timeout_blocks_with_the_step_named() {
    let h = Harness::with(COMMITTING_AGENT, &[("slow-step", SLOW_STEP)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T11"), Some("slow-step")).await.unwrap();
    let blocked = h.wait_for("T11", WorkflowStatus::Blocked).await;
    assert_eq!(
        blocked.block_reason,
        Some(BlockReason::StepTimeout {
            step: "slow".to_string(),
        })
    );
}

#[tokio::test]
async fn workflow_timeout_blocks_the_running_step() {
    let h = Harness::with(COMMITTING_AGENT, &[("slow-workflow", SLOW_WORKFLOW)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T12"), Some("slow-workflow")).await.unwrap();
    let blocked = h.wait_for("T12", WorkflowStatus::Blocked).await;
    assert_eq!(
        blocked.block_reason,
        Some(BlockReason::WorkflowTimeout {
            step: "slow".to_string(),
        })
    );
}

#[tokio::test]
async fn merge_conflict_blocks_and_keeps_worktree() {
    let h = Harness::with(COMMITTING_AGENT, &[("diverging", DIVERGING_MERGE)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T13"), Some("diverging")).await.unwrap();
    let blocked = h.wait_for("T13", WorkflowStatus::Blocked).await;
    assert_eq!(
        blocked.block_reason,
        Some(BlockReason::MergeConflict {
            step: "merge".to_string(),
            files: vec!["README.md".to_string()],
        })
    );
    assert!(h.worktree("T13").exists());
    assert!(!blocked.step_results.contains_key("after"));
    // The aborted merge leaves main as it was.
    assert_eq!(git(&h.repo(), &["show", "main:README.md"]), "main version");
    assert_eq!(git(&h.repo(), &["status", "--porcelain"]), "");
}

#[tokio::test]
async fn unreviewed_merge_lands_and_continues() {
    let h = Harness::with(COMMITTING_AGENT, &[("direct", DIRECT_MERGE)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T14"), Some("direct")).await.unwrap();
    let done = h.wait_for("T14", WorkflowStatus::Completed).await;
    assert!(done.merge_commit.is_some());
    assert_eq!(done.step_results["after"].status, StepStatus::Succeeded);
    assert_eq!(git(&h.repo(), &["show", "main:extra.txt"]), "extra");

    let statuses: Vec<String> = engine
        .deps()
        .storage
        .list_events_for_task("T14")
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "WORKFLOW_STATUS_CHANGED")
        .map(|e| e.payload_json.clone())
        .collect();
    assert!(statuses.iter().all(|p| !p.contains("pending_merge")));
}

#[tokio::test]
async fn exit_loop_leaves_the_loop_early() {
    let h = Harness::with(COMMITTING_AGENT, &[("early-exit", EARLY_EXIT)], |_, _| {}).await;
    let engine = h.daemon.engine();

    engine.start(task("T15"), Some("early-exit")).await.unwrap();
    let done = h.wait_for("T15", WorkflowStatus::Completed).await;

    let progress = done.loop_iterations["attempts"];
    assert_eq!(progress.iterations, 1);
    assert!(!progress.cap_hit);
    assert!(!done.step_results.contains_key("later"));
    assert_eq!(done.step_results["attempts"].status, StepStatus::Succeeded);
    assert_eq!(done.step_results["after"].status, StepStatus::Succeeded);
    assert_eq!(step_starts(engine, "T15", "check").await, 1);
}

#[tokio::test]
async fn default_grimoire_fixes_failing_tests_before_review() {
    let h = Harness::new(FIXING_AGENT).await;
    let engine = h.daemon.engine();

    let repo = h.repo();
    let test_script = repo.join("scripts").join("test");
    std::fs::create_dir_all(test_script.parent().unwrap()).unwrap();
    std::fs::write(
        &test_script,
        "#!/bin/sh\necho checking fixed.txt\ntest -f fixed.txt\n",
    )
    .unwrap();
    std::fs::set_permissions(&test_script, std::fs::Permissions::from_mode(0o755)).unwrap();
    git(&repo, &["add", "scripts/test"]);
    git(&repo, &["commit", "-q", "-m", "add test runner"]);

    engine.start(task("T16"), Some("default")).await.unwrap();
    let pending = h.wait_for("T16", WorkflowStatus::PendingMerge).await;
    assert_eq!(pending.current_step_name.as_deref(), Some("merge"));
    assert_eq!(pending.loop_iterations["test-loop"].iterations, 2);
    assert!(!pending.loop_iterations["test-loop"].cap_hit);
    assert_eq!(pending.step_results["run-tests"].status, StepStatus::Succeeded);
    assert_eq!(pending.step_results["fix-tests"].status, StepStatus::Succeeded);
    assert_eq!(step_starts(engine, "T16", "run-tests").await, 2);
    assert_eq!(step_starts(engine, "T16", "fix-tests").await, 1);

    let spawned = engine
        .deps()
        .storage
        .list_events_for_task("T16")
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "AGENT_SPAWNED")
        .count();
    assert_eq!(spawned, 2);

    engine.approve_merge("T16").await.unwrap();
    h.wait_for("T16", WorkflowStatus::Completed).await;
    assert_eq!(git(&repo, &["show", "main:fixed.txt"]), "fixed");
    assert_eq!(git(&repo, &["show", "main:feature.txt"]), "feature");
}

/// Provider whose spawn panics, standing in for a bug inside a workflow run.
#[derive(Debug)]
struct PanickingAgent;

#[async_trait]
impl AgentProvider for PanickingAgent {
    async fn spawn(&self, config: AgentConfig) -> agent::Result<SpawnedAgent> {
        panic!("spawn exploded for {}", config.task_id);
    }

    async fn respond(&self, task_id: &str, _text: &str) -> agent::Result<()> {
        Err(AgentError::AgentNotFound(task_id.to_string()))
    }

    async fn terminate(&self, task_id: &str, _reason: &str) -> agent::Result<()> {
        Err(AgentError::AgentNotFound(task_id.to_string()))
    }

    async fn terminate_all(&self, _reason: &str) {}

    async fn adopt(&self, record: AgentProcessRecord) -> agent::Result<()> {
        Err(AgentError::AgentNotFound(record.task_id))
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn is_running(&self, _task_id: &str) -> bool {
        false
    }

    fn running_step(&self, _task_id: &str) -> Option<String> {
        None
    }

    fn output_tail(&self, _task_id: &str, _n: usize) -> Option<Vec<OutputLine>> {
        None
    }
}

#[tokio::test]
async fn panicking_run_blocks_with_fault() {
    let h = Harness::new(COMMITTING_AGENT).await;
    let mut deps = h.daemon.engine().deps().clone();
    deps.agents = Arc::new(PanickingAgent);
    let engine = Engine::new(deps, EngineSettings::default());

    engine.start(task("T17"), Some("quick")).await.unwrap();
    h.wait_until("run to fault", || {
        engine.get("T17").unwrap().status == WorkflowStatus::Blocked
    })
    .await;

    let workflow = engine.get("T17").unwrap();
    assert!(matches!(workflow.block_reason, Some(BlockReason::Fault { .. })));
    assert!(workflow.error.is_some());
    // The engine keeps serving other control operations.
    assert!(engine.cancel("T17", "done").await.is_ok());
}
