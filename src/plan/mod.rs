//! Plans: the task graph produced by one planning round.
//!
//! - `task`: task nodes, typed arguments and status transitions
//! - `graph`: the validated [`Plan`]
//! - `parser`: planner text to [`Plan`], whole or streamed

mod graph;
mod parser;
mod task;

pub use graph::Plan;
pub use parser::{ParseError, PlanParser, PlanStream};
pub use task::{
    ArgValue, Argument, Fragment, Task, TaskError, TaskFailure, TaskFailureKind, TaskId,
    TaskStatus, JOIN_TOOL,
};
