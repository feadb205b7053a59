//! A validated plan: the task DAG of one planning round.

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskId};

/// Ordered collection of tasks produced by one planning round.
///
/// # Invariants
/// - Task ids are `1..=len` in order
/// - The last task is the join sentinel and depends on every other task
/// - Every dependency points to a strictly smaller id, so the graph is acyclic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    round: u32,
    goal: String,
    context: String,
    tasks: Vec<Task>,
    explicit_join: bool,
}

impl Plan {
    /// Build a plan from parser output. Callers must uphold the invariants.
    pub(crate) fn from_tasks(tasks: Vec<Task>, explicit_join: bool) -> Self {
        Self {
            round: 1,
            goal: String::new(),
            context: String::new(),
            tasks,
            explicit_join,
        }
    }

    /// Attach the round number and the context that triggered this plan.
    pub fn with_trigger(
        mut self,
        round: u32,
        goal: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        self.round = round;
        self.goal = goal.into();
        self.context = context.into();
        self
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    /// Number of tasks, the join sentinel included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether the planner wrote the `join` entry itself.
    pub fn has_explicit_join(&self) -> bool {
        self.explicit_join
    }

    pub fn join_id(&self) -> TaskId {
        TaskId::new(self.tasks.len() as u32)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        let index = (id.get() as usize).checked_sub(1)?;
        self.tasks.get(index)
    }

    /// Tasks other than the join sentinel.
    pub fn work_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.is_join())
    }
}
