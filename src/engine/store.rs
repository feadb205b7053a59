//! Result store: terminal outcome per task id, used to resolve references.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::plan::{TaskFailure, TaskId};

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { value: Value },
    Failed { failure: TaskFailure },
    Skipped,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Succeeded { value } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Outcome for task {0} was already recorded")]
    AlreadyRecorded(TaskId),
}

/// Append-only mapping from task id to outcome.
///
/// # Invariants
/// - An entry is written at most once and never overwritten
#[derive(Debug, Default, Clone)]
pub struct ResultStore {
    entries: BTreeMap<TaskId, TaskOutcome>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        if self.entries.contains_key(&id) {
            return Err(StoreError::AlreadyRecorded(id));
        }
        self.entries.insert(id, outcome);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskOutcome> {
        self.entries.get(&id)
    }

    /// The value of a succeeded task.
    pub fn value(&self, id: TaskId) -> Option<&Value> {
        self.get(id).and_then(TaskOutcome::value)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &TaskOutcome)> {
        self.entries.iter().map(|(id, outcome)| (*id, outcome))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
