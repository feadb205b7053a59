//! Execution engine: runs plans and drives the replanning loop.
//!
//! - `store`: append-only [`ResultStore`]
//! - `fetching`: [`TaskFetchingUnit`], dependency counts and the ready queue
//! - `executor`: bounded worker pool behind a single coordinator
//! - `joiner`: [`Joiner`] and [`RoundSummary`]
//! - `orchestrator`: the bounded plan → execute → join → replan loop
//! - `events`: progress broadcast

mod events;
mod executor;
mod fetching;
mod joiner;
mod orchestrator;
mod retry;
mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{EngineEvent, EventKind, EventSink, RunId};
pub use executor::{Executor, RoundExecution};
pub use fetching::TaskFetchingUnit;
pub use joiner::{JoinDecision, Joiner, RoundSummary, TaskReport};
pub use orchestrator::{Orchestrator, RoundReport, RunOutcome, RunStatus};
pub use retry::RetryPolicy;
pub use store::{ResultStore, StoreError, TaskOutcome};

use crate::capability::CapabilityError;
use crate::plan::{ParseError, TaskError, TaskId};

/// Errors that end a run.
///
/// Task-level failures are not here: they are recorded on the task and
/// only travel along dependency edges.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Planning failed: {0}")]
    Planning(CapabilityError),

    #[error("Answer synthesis failed: {0}")]
    Synthesis(CapabilityError),

    #[error("No valid plan after {attempts} attempt(s): {last}")]
    PlanRejected { attempts: u32, last: ParseError },

    #[error("Exhausted {0} planning round(s) without an answer")]
    MaxRoundsExceeded(u32),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Execution stalled with unfinished tasks {pending:?}")]
    Stalled { pending: Vec<TaskId> },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Worker failed: {0}")]
    Worker(String),
}
