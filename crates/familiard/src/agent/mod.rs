//! Agent provider: one supervised subprocess per task.
//!
//! A provider owns the process table for its agents. `spawn` returns a channel of
//! [`AgentEvent`]s with a fixed order: `Spawned` first, then any number of `Output`
//! and `Question` events, then exactly one `Exited`.

mod buffer;
mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use familiar_core::{AgentProcessRecord, AgentResult, OutputStream, Question};
use thiserror::Error;
use tokio::sync::mpsc;

pub use buffer::{OutputBuffer, OutputLine, DEFAULT_MAX_BYTES, DEFAULT_MAX_LINES};
pub use process::{ProcessProvider, ProcessProviderConfig};

/// Largest answer accepted by `respond`.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent already running for task {0}")]
    AlreadyRunning(String),
    #[error("no agent registered for task {0}")]
    AgentNotFound(String),
    #[error("agent executable not found: {0}")]
    BinaryNotFound(String),
    #[error("agent for task {0} has exited")]
    NotRunning(String),
    #[error("agent input closed for task {0}")]
    StdinClosed(String),
    #[error("response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: usize, max: usize },
    #[error("worktree does not exist: {0}")]
    WorktreeMissing(PathBuf),
    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AgentNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub task_id: String,
    /// Step invocation this agent serves, e.g. `T1/implement`.
    pub step_task_id: String,
    pub worktree: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Spawned { pid: u32, command: String },
    Output { stream: OutputStream, line: String },
    /// A question was detected and recorded in the question store.
    Question(Question),
    Exited(AgentResult),
}

#[derive(Debug)]
pub struct SpawnedAgent {
    pub pid: u32,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
}

#[async_trait]
pub trait AgentProvider: Send + Sync + std::fmt::Debug {
    /// Launch an agent. Fails if one is already registered for the task.
    async fn spawn(&self, config: AgentConfig) -> Result<SpawnedAgent>;

    /// Write an answer line to the agent's stdin.
    async fn respond(&self, task_id: &str, text: &str) -> Result<()>;

    /// Ask the agent to stop: graceful signal first, forced kill after the grace period.
    async fn terminate(&self, task_id: &str, reason: &str) -> Result<()>;

    /// Terminate every agent and wait (bounded) for them to exit.
    async fn terminate_all(&self, reason: &str);

    /// Take over supervision of a process left behind by a previous daemon.
    async fn adopt(&self, record: AgentProcessRecord) -> Result<()>;

    /// Fast check that the agent executable can be launched at all.
    async fn is_available(&self) -> bool;

    fn is_running(&self, task_id: &str) -> bool;

    /// Step invocation served by the task's live agent.
    fn running_step(&self, task_id: &str) -> Option<String>;

    /// Last `n` output lines of the task's current or most recent agent.
    fn output_tail(&self, task_id: &str, n: usize) -> Option<Vec<OutputLine>>;
}
