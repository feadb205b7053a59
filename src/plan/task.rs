//! Task graph data model.
//!
//! A [`Task`] is one node of a plan: a tool invocation with typed arguments
//! and a dependency set. Tasks are created by the parser and only change
//! status through the explicit transitions below.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved tool name of the sentinel task that closes a plan.
pub const JOIN_TOOL: &str = "join";

/// Identifier of a task within one plan.
///
/// # Properties
/// - Assigned consecutively from 1 in plan order
/// - A task only ever depends on strictly smaller ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Piece of a quoted string that embeds references, e.g. `"hotels near $1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fragment {
    Text(String),
    Reference(TaskId),
}

/// Argument value as written by the planner.
///
/// References are kept typed until the executor resolves them against the
/// result store; nothing is substituted by string replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    /// Plain JSON value (string, number, bool, null, literal list)
    Literal(Value),
    /// The whole result of another task
    Reference(TaskId),
    /// A string with embedded references
    Template(Vec<Fragment>),
    /// A list with at least one non-literal element
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Collect every task id this value refers to.
    pub fn collect_references(&self, out: &mut BTreeSet<TaskId>) {
        match self {
            ArgValue::Literal(_) => {}
            ArgValue::Reference(id) => {
                out.insert(*id);
            }
            ArgValue::Template(fragments) => {
                for fragment in fragments {
                    if let Fragment::Reference(id) = fragment {
                        out.insert(*id);
                    }
                }
            }
            ArgValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, ArgValue::Literal(_))
    }
}

/// A single positional or keyword argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    /// Keyword name for `key=value` arguments
    pub name: Option<String>,
    pub value: ArgValue,
}

impl Argument {
    pub fn positional(value: ArgValue) -> Self {
        Self { name: None, value }
    }

    pub fn named(name: impl Into<String>, value: ArgValue) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Ready -> Running -> Succeeded
///        \                   \-> Failed
///         \-> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureKind {
    /// The tool did not answer within the per-task timeout
    Timeout,
    /// The tool returned an error (or does not exist)
    ToolInvocation,
    /// A referenced result was missing; this is a scheduler bug
    ArgumentResolution,
}

impl fmt::Display for TaskFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailureKind::Timeout => write!(f, "Timeout"),
            TaskFailureKind::ToolInvocation => write!(f, "ToolInvocationError"),
            TaskFailureKind::ArgumentResolution => write!(f, "ArgumentResolutionError"),
        }
    }
}

/// Error record of a terminally failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: TaskFailureKind,
    pub message: String,
    /// Number of invocation attempts made (0 if never invoked)
    pub attempts: u32,
}

impl TaskFailure {
    pub fn new(kind: TaskFailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (after {} attempt{})",
            self.kind,
            self.message,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )
    }
}

/// A node of the task graph.
///
/// # Invariants
/// - Every id in `dependencies` is strictly smaller than `id`
/// - `result.is_some()` iff `status == Succeeded`
/// - `failure.is_some()` iff `status == Failed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    tool: String,
    arguments: Vec<Argument>,
    dependencies: BTreeSet<TaskId>,
    rationale: Option<String>,
    status: TaskStatus,
    result: Option<Value>,
    failure: Option<TaskFailure>,
    #[serde(skip)]
    dispatched_at: Option<Instant>,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl Task {
    /// Create a pending task.
    ///
    /// The dependency set is the union of `explicit_dependencies` and every
    /// id referenced by the arguments.
    pub fn new(
        id: TaskId,
        tool: impl Into<String>,
        arguments: Vec<Argument>,
        explicit_dependencies: impl IntoIterator<Item = TaskId>,
        rationale: Option<String>,
    ) -> Self {
        let mut dependencies: BTreeSet<TaskId> = explicit_dependencies.into_iter().collect();
        for argument in &arguments {
            argument.value.collect_references(&mut dependencies);
        }

        Self {
            id,
            tool: tool.into(),
            arguments,
            dependencies,
            rationale,
            status: TaskStatus::Pending,
            result: None,
            failure: None,
            dispatched_at: None,
            finished_at: None,
        }
    }

    /// Create the join sentinel depending on every task before it.
    pub fn join(id: TaskId, rationale: Option<String>) -> Self {
        let dependencies = (1..id.get()).map(TaskId::new);
        Self::new(id, JOIN_TOOL, Vec::new(), dependencies, rationale)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn is_join(&self) -> bool {
        self.tool == JOIN_TOOL
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn dependencies(&self) -> &BTreeSet<TaskId> {
        &self.dependencies
    }

    pub fn rationale(&self) -> Option<&str> {
        self.rationale.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn dispatched_at(&self) -> Option<Instant> {
        self.dispatched_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    // State transitions - explicit and validated

    /// `Pending -> Ready`
    pub fn mark_ready(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Pending, TaskStatus::Ready)
    }

    /// `Ready -> Running`, stamping the dispatch time.
    pub fn start(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Ready, TaskStatus::Running)?;
        self.dispatched_at = Some(Instant::now());
        Ok(())
    }

    /// `Running -> Succeeded`
    pub fn succeed(&mut self, result: Value) -> Result<(), TaskError> {
        self.transition(TaskStatus::Running, TaskStatus::Succeeded)?;
        self.result = Some(result);
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    /// `Running -> Failed`
    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), TaskError> {
        self.transition(TaskStatus::Running, TaskStatus::Failed)?;
        self.failure = Some(failure);
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    /// `Pending -> Skipped`; a skipped task never runs.
    pub fn skip(&mut self) -> Result<(), TaskError> {
        self.transition(TaskStatus::Pending, TaskStatus::Skipped)?;
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        if self.status != from {
            return Err(TaskError::InvalidTransition {
                task: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Errors that can occur during task state changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid state transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {0} is not part of this plan")]
    UnknownTask(TaskId),
}
