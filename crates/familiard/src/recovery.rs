//! Startup reconciliation after a daemon restart.
//!
//! Persisted workflows are reloaded (running ones block as interrupted), every agent
//! process record is checked against the OS process table, and task worktrees without
//! a live workflow are reported as orphans.
//!
//! A remembered PID is only trusted when the process behind it is provably the agent
//! that was spawned: its kernel start time and command line must match the record.
//! Anything that cannot be verified is reported as ambiguous and left alone.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use familiar_core::events::{EventPayload, RecoveryOutcomePayload, WorktreeOrphanedPayload};
use familiar_core::AgentProcessRecord;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::AgentProvider;
use crate::engine::{Engine, EngineError};
use crate::events::EventBus;
use crate::procinfo::{self, Liveness};
use crate::records::{ProcessRecordStore, RecordStoreError};
use crate::worktree::{OrphanWorktree, WorktreeError, WorktreeManager};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Outcome of validating a remembered agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The PID still runs the agent that was spawned.
    Alive,
    /// The agent is gone (or the PID now belongs to something else).
    Dead,
    /// Identity could not be verified; needs manual review.
    Ambiguous,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::Ambiguous => "ambiguous",
        }
    }
}

fn command_matches(record: &AgentProcessRecord, cmdline: &[String]) -> bool {
    let expected = Path::new(&record.command);
    let expected_name = expected.file_name();
    cmdline.iter().any(|arg| {
        arg == &record.command
            || (expected_name.is_some() && Path::new(arg).file_name() == expected_name)
    })
}

/// Validate a record against the live process table. Blocking (reads procfs).
pub fn classify(record: &AgentProcessRecord) -> (Verdict, String) {
    let pid = record.pid;
    match procinfo::probe(pid) {
        Liveness::Gone => return (Verdict::Dead, "process not found".to_string()),
        Liveness::Unknown => {
            return (Verdict::Ambiguous, "process liveness could not be determined".to_string());
        }
        Liveness::Running => {}
    }
    if !procinfo::procfs_available() {
        return (
            Verdict::Ambiguous,
            "process is running but its identity cannot be verified".to_string(),
        );
    }

    let Some(stat) = procinfo::read_stat(pid) else {
        return (Verdict::Dead, "process exited during validation".to_string());
    };
    if stat.is_zombie() {
        return (Verdict::Dead, "process is a zombie".to_string());
    }
    match record.start_ticks {
        Some(ticks) if ticks != stat.start_ticks => {
            return (
                Verdict::Dead,
                format!("pid reused: start time {} differs from recorded {ticks}", stat.start_ticks),
            );
        }
        Some(_) => {}
        None => {
            return (
                Verdict::Ambiguous,
                "no recorded start time to compare against".to_string(),
            );
        }
    }

    match procinfo::read_cmdline(pid) {
        Some(cmdline) if command_matches(record, &cmdline) => (
            Verdict::Alive,
            "start time and command line match the record".to_string(),
        ),
        Some(cmdline) => (
            Verdict::Dead,
            format!("pid reused: command line is `{}`", cmdline.join(" ")),
        ),
        None => (
            Verdict::Ambiguous,
            "command line could not be read".to_string(),
        ),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Workflows that were running and are now blocked.
    pub interrupted: Vec<String>,
    pub adopted: Vec<String>,
    pub dead: Vec<String>,
    pub ambiguous: Vec<String>,
    pub orphans: Vec<OrphanWorktree>,
}

#[derive(Debug)]
pub struct RecoveryCoordinator {
    engine: Engine,
    agents: Arc<dyn AgentProvider>,
    records: ProcessRecordStore,
    worktrees: Arc<WorktreeManager>,
    bus: Arc<EventBus>,
    /// Orphan paths already announced, so periodic scans only report new ones.
    reported: Mutex<HashSet<String>>,
}

impl RecoveryCoordinator {
    pub fn new(engine: Engine, records: ProcessRecordStore) -> Self {
        let deps = engine.deps().clone();
        Self {
            engine,
            agents: deps.agents,
            records,
            worktrees: deps.worktrees,
            bus: deps.bus,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Run the full startup reconciliation.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            interrupted: self.engine.rehydrate().await?,
            ..RecoveryReport::default()
        };

        for record in self.records.list()? {
            let task_id = record.task_id.clone();
            let (verdict, detail) = {
                let record = record.clone();
                tokio::task::spawn_blocking(move || classify(&record))
                    .await
                    .unwrap_or_else(|e| (Verdict::Ambiguous, format!("validation failed: {e}")))
            };
            info!(task_id = %task_id, pid = record.pid, verdict = verdict.as_str(), detail = %detail, "recovered agent record");
            self.bus
                .emit(EventPayload::RecoveryOutcome(RecoveryOutcomePayload {
                    task_id: task_id.clone(),
                    pid: record.pid,
                    verdict: verdict.as_str().to_string(),
                    detail,
                }))
                .await;

            match verdict {
                Verdict::Alive => self.adopt(record, &mut report).await,
                Verdict::Dead => {
                    if let Err(e) = self.records.remove(&task_id).await {
                        warn!(task_id = %task_id, error = %e, "failed to remove stale agent record");
                    }
                    report.dead.push(task_id);
                }
                Verdict::Ambiguous => {
                    warn!(task_id = %task_id, pid = record.pid, "agent process needs manual review");
                    report.ambiguous.push(task_id);
                }
            }
        }

        report.orphans = self.scan_orphans().await?;
        info!(
            interrupted = report.interrupted.len(),
            adopted = report.adopted.len(),
            dead = report.dead.len(),
            ambiguous = report.ambiguous.len(),
            orphans = report.orphans.len(),
            "recovery complete"
        );
        Ok(report)
    }

    async fn adopt(&self, record: AgentProcessRecord, report: &mut RecoveryReport) {
        let task_id = record.task_id.clone();
        // Without a workflow to serve, a surviving agent is stopped.
        let owner_active = self
            .engine
            .get(&task_id)
            .is_ok_and(|wf| !wf.status.is_terminal());
        if let Err(e) = self.agents.adopt(record).await {
            warn!(task_id = %task_id, error = %e, "failed to adopt agent process");
            report.ambiguous.push(task_id);
            return;
        }
        if !owner_active {
            if let Err(e) = self.agents.terminate(&task_id, "no active workflow").await {
                warn!(task_id = %task_id, error = %e, "failed to stop unowned agent");
            }
        }
        report.adopted.push(task_id);
    }

    /// Find task worktrees no live workflow accounts for. New findings are announced;
    /// nothing is deleted.
    pub async fn scan_orphans(&self) -> Result<Vec<OrphanWorktree>> {
        let live = self.engine.live_tasks();
        let orphans = self.worktrees.detect_orphans(&live).await?;

        let fresh: Vec<OrphanWorktree> = {
            let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
            reported.retain(|path| orphans.iter().any(|o| &o.path == path));
            orphans
                .iter()
                .filter(|o| reported.insert(o.path.clone()))
                .cloned()
                .collect()
        };
        for orphan in fresh {
            warn!(path = %orphan.path, branch = ?orphan.branch, reason = %orphan.reason, "orphaned worktree");
            self.bus
                .emit(EventPayload::WorktreeOrphaned(WorktreeOrphanedPayload {
                    worktree_path: orphan.path,
                    branch: orphan.branch,
                    reason: orphan.reason,
                }))
                .await;
        }
        Ok(orphans)
    }
}
