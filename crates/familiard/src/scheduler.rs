//! Agent-slot scheduling.
//!
//! A counting semaphore caps how many agent subprocesses run at once across all
//! workflows. An agent step holds an owned permit from before spawn until its agent
//! exits.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Default maximum concurrent agents.
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 3;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A held agent slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AgentSlot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct AgentSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AgentSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a free slot. Callers bound the wait by racing it against their
    /// step window; dropping the future abandons the wait.
    pub async fn acquire(&self) -> Result<AgentSlot> {
        let semaphore = Arc::clone(&self.semaphore);
        let permit = match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::Closed) => return Err(SchedulerError::Shutdown),
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                debug!(capacity = self.capacity, "all agent slots busy; waiting");
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SchedulerError::Shutdown)?
            }
        };
        Ok(AgentSlot { _permit: permit })
    }

    /// Refuse new acquisitions; waiters fail with `Shutdown`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
