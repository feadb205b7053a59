//! Task Fetching Unit: dependency counting and the ready queue.
//!
//! The fetching unit owns the execution state of one round. It is only ever
//! touched by the coordinator; workers report back through completions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::FailurePolicy;
use crate::plan::{Plan, Task, TaskError, TaskId, TaskStatus};

use super::store::TaskOutcome;

/// Execution state of one plan.
///
/// # Invariants
/// - `remaining[t]` is the number of dependencies of `t` not yet terminal
/// - A task is in `ready` only while its status is `Ready`
/// - A task leaves `ready` at most once, so it is dispatched at most once
/// - The join sentinel is never queued; `join_ready` flips when it would be
pub struct TaskFetchingUnit {
    tasks: BTreeMap<TaskId, Task>,
    remaining: HashMap<TaskId, usize>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    ready: BTreeSet<TaskId>,
    in_flight: BTreeSet<TaskId>,
    join_id: TaskId,
    join_ready: bool,
    policy: FailurePolicy,
    cancelled: bool,
}

impl TaskFetchingUnit {
    /// Build the execution state and enqueue every task without dependencies.
    pub fn initialize(plan: Plan, policy: FailurePolicy) -> Result<Self, TaskError> {
        let join_id = plan.join_id();
        let mut tasks = BTreeMap::new();
        let mut remaining = HashMap::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

        for task in plan.into_tasks() {
            remaining.insert(task.id(), task.dependencies().len());
            for dependency in task.dependencies() {
                dependents.entry(*dependency).or_default().push(task.id());
            }
            tasks.insert(task.id(), task);
        }

        let mut unit = Self {
            tasks,
            remaining,
            dependents,
            ready: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            join_id,
            join_ready: false,
            policy,
            cancelled: false,
        };

        let roots: Vec<TaskId> = unit
            .remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in roots {
            unit.make_ready(id)?;
        }

        tracing::debug!(
            "Initialized fetching unit: {} tasks, {} ready",
            unit.tasks.len(),
            unit.ready.len()
        );
        Ok(unit)
    }

    /// Dequeue the lowest ready id and mark it running.
    ///
    /// Returns `None` when nothing is ready right now; the caller should wait
    /// for an in-flight completion.
    pub fn pop_ready(&mut self) -> Result<Option<TaskId>, TaskError> {
        if self.cancelled {
            return Ok(None);
        }
        let Some(id) = self.ready.pop_first() else {
            return Ok(None);
        };
        self.task_mut(id)?.start()?;
        self.in_flight.insert(id);
        Ok(Some(id))
    }

    /// Apply the outcome of a dispatched task and unblock its dependents.
    ///
    /// Returns the ids skipped as a consequence, in ascending order.
    pub fn on_task_completed(
        &mut self,
        id: TaskId,
        outcome: &TaskOutcome,
    ) -> Result<Vec<TaskId>, TaskError> {
        let task = self.task_mut(id)?;
        match outcome {
            TaskOutcome::Succeeded { value } => task.succeed(value.clone())?,
            TaskOutcome::Failed { failure } => task.fail(failure.clone())?,
            TaskOutcome::Skipped => task.skip()?,
        }
        self.in_flight.remove(&id);

        let mut skipped = Vec::new();
        let mut worklist = vec![(id, outcome.is_success())];

        while let Some((finished, success)) = worklist.pop() {
            let dependents = self.dependents.get(&finished).cloned().unwrap_or_default();
            for dependent in dependents {
                let count = self
                    .remaining
                    .get_mut(&dependent)
                    .ok_or(TaskError::UnknownTask(dependent))?;
                *count = count.saturating_sub(1);
                let unblocked = *count == 0;

                if dependent == self.join_id {
                    if unblocked {
                        self.make_ready(dependent)?;
                    }
                    continue;
                }

                let status = self.task(dependent).map(Task::status);
                if status != Some(TaskStatus::Pending) {
                    continue;
                }

                if !success && self.policy == FailurePolicy::FailFast {
                    self.task_mut(dependent)?.skip()?;
                    tracing::debug!("Skipping task {}: dependency {} did not succeed", dependent, finished);
                    skipped.push(dependent);
                    worklist.push((dependent, false));
                } else if unblocked {
                    self.make_ready(dependent)?;
                }
            }
        }

        skipped.sort();
        Ok(skipped)
    }

    /// Stop handing out work. Already running tasks are left to the caller.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// All real tasks are terminal.
    pub fn is_join_ready(&self) -> bool {
        self.join_ready
    }

    /// Nothing is ready, nothing runs, yet the join is not reached.
    ///
    /// Cannot happen for a plan that satisfies the ordering invariant.
    pub fn is_stalled(&self) -> bool {
        !self.join_ready && self.ready.is_empty() && self.in_flight.is_empty()
    }

    pub fn has_ready(&self) -> bool {
        !self.cancelled && !self.ready.is_empty()
    }

    pub fn in_flight(&self) -> &BTreeSet<TaskId> {
        &self.in_flight
    }

    pub fn join_id(&self) -> TaskId {
        self.join_id
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Tasks in id order, the join sentinel included.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Tasks other than the join sentinel.
    pub fn work_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| !t.is_join())
    }

    /// Number of dependencies of `id` not yet terminal.
    pub fn remaining_dependencies(&self, id: TaskId) -> Option<usize> {
        self.remaining.get(&id).copied()
    }

    fn make_ready(&mut self, id: TaskId) -> Result<(), TaskError> {
        self.task_mut(id)?.mark_ready()?;
        if id == self.join_id {
            tracing::debug!("Join task {} is ready", id);
            self.join_ready = true;
        } else {
            self.ready.insert(id);
        }
        Ok(())
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, TaskError> {
        self.tasks.get_mut(&id).ok_or(TaskError::UnknownTask(id))
    }
}
