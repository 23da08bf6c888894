//! Hierarchical deadlines and cancellation for workflows and steps.
//!
//! A [`TimeoutManager`] owns the workflow window. Step windows are derived from it (or
//! from each other for loops) as a tree of [`StepContext`]s: each child deadline is
//! `min(requested, parent deadline)` and each child token is a child of its parent's
//! token, so cancelling an ancestor cancels every descendant.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// The step's own window (or an enclosing loop's window).
    Step,
    /// The workflow budget, inherited by the step.
    Workflow,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("deadline elapsed before step '{step}' could start")]
    DeadlineElapsed { step: String, cause: TimeoutCause },
}

pub type Result<T> = std::result::Result<T, TimeoutError>;

/// Why a scoped future did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    TimedOut(TimeoutCause),
}

/// The workflow-level window.
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    root: StepContext,
}

impl TimeoutManager {
    pub fn new(budget: Duration) -> Self {
        Self::with_parent(budget, &CancellationToken::new())
    }

    /// Workflow window whose token is a child of `parent`.
    pub fn with_parent(budget: Duration, parent: &CancellationToken) -> Self {
        Self {
            root: StepContext {
                name: "workflow".to_string(),
                deadline: Instant::now() + budget,
                cause: TimeoutCause::Workflow,
                token: parent.child_token(),
            },
        }
    }

    /// The workflow scope itself.
    pub fn root(&self) -> &StepContext {
        &self.root
    }

    /// Derive a step window from the workflow window.
    pub fn step_context(&self, name: &str, requested: Duration) -> Result<StepContext> {
        self.root.step_context(name, requested)
    }

    pub fn remaining(&self) -> Duration {
        self.root.remaining()
    }

    pub fn cancel(&self) {
        self.root.token.cancel();
    }
}

/// A cancellable execution window for one step, loop or loop iteration.
#[derive(Debug, Clone)]
pub struct StepContext {
    name: String,
    deadline: Instant,
    /// Cause reported when `deadline` fires.
    cause: TimeoutCause,
    token: CancellationToken,
}

impl StepContext {
    /// Child window clamped to this one. Fails if this window has already elapsed.
    pub fn step_context(&self, name: &str, requested: Duration) -> Result<Self> {
        self.ensure_open(name)?;
        let requested_deadline = Instant::now().checked_add(requested);
        let (deadline, cause) = match requested_deadline {
            Some(d) if d < self.deadline => (d, TimeoutCause::Step),
            _ => (self.deadline, self.cause),
        };
        Ok(Self {
            name: name.to_string(),
            deadline,
            cause,
            token: self.token.child_token(),
        })
    }

    /// Child scope sharing this window's deadline, e.g. one loop iteration.
    pub fn inherit(&self, name: &str) -> Result<Self> {
        self.ensure_open(name)?;
        Ok(Self {
            name: name.to_string(),
            deadline: self.deadline,
            cause: self.cause,
            token: self.token.child_token(),
        })
    }

    fn ensure_open(&self, name: &str) -> Result<()> {
        match self.check_timeout() {
            Some(cause) => Err(TimeoutError::DeadlineElapsed {
                step: name.to_string(),
                cause,
            }),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Which deadline has fired, if any.
    pub fn check_timeout(&self) -> Option<TimeoutCause> {
        (Instant::now() >= self.deadline).then_some(self.cause)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `fut` within this window.
    ///
    /// When the deadline fires or an ancestor is cancelled, this scope's token is
    /// cancelled and `fut` is still awaited to completion. Futures must observe
    /// [`StepContext::token`] and wind down promptly (terminating subprocesses); their
    /// output is discarded in that case.
    pub async fn run<F: Future>(&self, fut: F) -> std::result::Result<F::Output, Interrupted> {
        tokio::pin!(fut);
        let interrupted = tokio::select! {
            out = &mut fut => return Ok(out),
            () = self.token.cancelled() => self.interruption(),
            () = tokio::time::sleep_until(self.deadline) => Interrupted::TimedOut(self.cause),
        };
        self.token.cancel();
        fut.await;
        Err(interrupted)
    }

    /// Classify a cancellation: an elapsed deadline wins over a plain cancel because an
    /// ancestor timing out cancels this scope too.
    pub fn interruption(&self) -> Interrupted {
        match self.check_timeout() {
            Some(cause) => Interrupted::TimedOut(cause),
            None => Interrupted::Cancelled,
        }
    }
}
