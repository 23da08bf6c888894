//! Per-workflow state cell.
//!
//! Each workflow has one cell holding its latest record, the grimoire it runs and the
//! handle of its active interpreter run. Writers hold `control` (an async lock) for the
//! whole read-modify-persist sequence; the record itself sits behind a std mutex that
//! is only held for the in-memory update so readers never wait on I/O.
//!
//! Every interpreter run is stamped with a generation. Control operations that take the
//! workflow away from a run (cancel, retry, approve) bump the generation first, so any
//! later commit from the superseded run is rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use familiar_core::{ControlAction, Grimoire, Workflow, WorkflowStatus};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An interpreter run owning a workflow.
#[derive(Debug, Clone)]
pub(super) struct RunHandle {
    pub(super) generation: u64,
    /// Cancels the run and everything it started.
    pub(super) token: CancellationToken,
    /// Cancelled once the run task has returned.
    pub(super) done: CancellationToken,
}

#[derive(Debug)]
pub(super) struct WorkflowCell {
    pub(super) control: tokio::sync::Mutex<()>,
    record: Mutex<Workflow>,
    grimoire: Mutex<Option<Arc<Grimoire>>>,
    generation: AtomicU64,
    run: Mutex<Option<RunHandle>>,
}

impl WorkflowCell {
    pub(super) fn new(workflow: Workflow, grimoire: Option<Arc<Grimoire>>) -> Self {
        Self {
            control: tokio::sync::Mutex::new(()),
            record: Mutex::new(workflow),
            grimoire: Mutex::new(grimoire),
            generation: AtomicU64::new(1),
            run: Mutex::new(None),
        }
    }

    pub(super) fn snapshot(&self) -> Workflow {
        lock(&self.record).clone()
    }

    pub(super) fn status(&self) -> WorkflowStatus {
        lock(&self.record).status
    }

    /// Apply a change and refresh derived fields. Returns the status before the change
    /// and the updated record.
    pub(super) fn update(&self, change: impl FnOnce(&mut Workflow)) -> (WorkflowStatus, Workflow) {
        let mut record = lock(&self.record);
        let before = record.status;
        change(&mut record);
        record.updated_at = Utc::now();
        record.available_actions = ControlAction::available(record.status);
        (before, record.clone())
    }

    pub(super) fn grimoire(&self) -> Option<Arc<Grimoire>> {
        lock(&self.grimoire).clone()
    }

    pub(super) fn set_grimoire(&self, grimoire: Arc<Grimoire>) {
        *lock(&self.grimoire) = Some(grimoire);
    }

    pub(super) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(super) fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Invalidate the current run and return the new generation.
    pub(super) fn fence(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn current_run(&self) -> Option<RunHandle> {
        lock(&self.run).clone()
    }

    /// Install a new run, returning the one it replaces.
    pub(super) fn replace_run(&self, handle: RunHandle) -> Option<RunHandle> {
        lock(&self.run).replace(handle)
    }
}
