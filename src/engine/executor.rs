//! Executor: bounded worker pool driven by a single coordinator.
//!
//! The coordinator (the task calling [`Executor::run_round`]) is the only
//! writer of the fetching unit and the result store. Workers receive fully
//! resolved arguments, call the tool with a timeout and retries, and hand a
//! [`Completion`] back through the join set.
//!
//! ```text
//!            pop_ready            spawn (<= W)
//!   TFU ───────────────▶ coordinator ─────────▶ worker ─▶ Tool::invoke
//!    ▲                        │   ▲                 │
//!    │ on_task_completed      │   └─── Completion ──┘
//!    └────────────────────────┤
//!                             ▼
//!                        ResultStore
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::plan::{ArgValue, Fragment, Task, TaskFailure, TaskFailureKind, TaskId, TaskStatus};
use crate::tools::{Tool, ToolInput, ToolRegistry};

use super::events::{EventKind, EventSink};
use super::fetching::TaskFetchingUnit;
use super::retry::RetryPolicy;
use super::store::{ResultStore, TaskOutcome};
use super::EngineError;

/// How a round's execution ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundExecution {
    /// The round deadline passed before the join became ready
    pub timed_out: bool,
    /// The run's cancellation token fired
    pub cancelled: bool,
    /// Tasks still running when the round was cut short; their results are discarded
    pub abandoned: Vec<TaskId>,
}

impl RoundExecution {
    pub fn completed(&self) -> bool {
        !self.timed_out && !self.cancelled
    }
}

/// What a worker reports back to the coordinator.
#[derive(Debug)]
struct Completion {
    id: TaskId,
    outcome: TaskOutcome,
    attempts: u32,
}

/// Everything a worker needs; it never sees coordinator state.
struct Dispatch {
    round: u32,
    id: TaskId,
    tool: Arc<dyn Tool>,
    input: ToolInput,
    timeout: Duration,
    retry: RetryPolicy,
    events: EventSink,
}

/// Runs the ready tasks of a round on at most `max_workers` workers.
pub struct Executor {
    tools: Arc<ToolRegistry>,
    max_workers: usize,
    task_timeout: Duration,
    retry: RetryPolicy,
    events: EventSink,
}

impl Executor {
    pub fn new(tools: Arc<ToolRegistry>, config: &EngineConfig, events: EventSink) -> Self {
        Self {
            tools,
            max_workers: config.max_workers.max(1),
            task_timeout: config.task_timeout,
            retry: config.retry,
            events,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Drain the ready queue until the join is ready, the deadline passes or
    /// `cancel` fires.
    ///
    /// # Postconditions
    /// - On normal return every work task is terminal and has a store entry
    /// - On timeout or cancellation no further task is dispatched; running
    ///   workers finish in the background and their results are dropped
    pub async fn run_round(
        &self,
        round: u32,
        fetcher: &mut TaskFetchingUnit,
        store: &mut ResultStore,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<RoundExecution, EngineError> {
        let mut workers: JoinSet<Completion> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.interrupt(round, fetcher, workers, false));
            }
            if Instant::now() >= deadline {
                return Ok(self.interrupt(round, fetcher, workers, true));
            }

            while workers.len() < self.max_workers {
                let Some(id) = fetcher.pop_ready()? else {
                    break;
                };
                match self.prepare(round, id, fetcher, store) {
                    Ok(dispatch) => {
                        workers.spawn(run_worker(dispatch));
                    }
                    Err(failure) => {
                        let completion = Completion {
                            id,
                            outcome: TaskOutcome::Failed { failure },
                            attempts: 0,
                        };
                        self.apply(round, fetcher, store, completion)?;
                    }
                }
            }

            if fetcher.is_join_ready() {
                return Ok(RoundExecution::default());
            }

            if workers.is_empty() {
                if fetcher.has_ready() {
                    continue;
                }
                let pending = fetcher
                    .work_tasks()
                    .filter(|t| !t.status().is_terminal())
                    .map(Task::id)
                    .collect();
                return Err(EngineError::Stalled { pending });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.interrupt(round, fetcher, workers, false));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(self.interrupt(round, fetcher, workers, true));
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(completion)) => self.apply(round, fetcher, store, completion)?,
                    Some(Err(e)) => return Err(EngineError::Worker(e.to_string())),
                    None => {}
                },
            }
        }
    }

    /// Resolve arguments on the coordinator and package the worker input.
    fn prepare(
        &self,
        round: u32,
        id: TaskId,
        fetcher: &TaskFetchingUnit,
        store: &ResultStore,
    ) -> Result<Dispatch, TaskFailure> {
        let task = fetcher.task(id).ok_or_else(|| {
            TaskFailure::new(TaskFailureKind::ArgumentResolution, format!("Task {} vanished", id), 0)
        })?;

        let tool = self.tools.get(task.tool()).ok_or_else(|| {
            tracing::warn!("Task {} calls unknown tool '{}'", id, task.tool());
            TaskFailure::new(
                TaskFailureKind::ToolInvocation,
                format!("Unknown tool '{}'", task.tool()),
                0,
            )
        })?;

        let input = resolve_arguments(task, store).map_err(|missing| {
            tracing::error!(
                "Task {} references result {} which is not in the store; this is a scheduler bug",
                id,
                missing
            );
            TaskFailure::new(
                TaskFailureKind::ArgumentResolution,
                format!("Result of task {} is not available", missing),
                0,
            )
        })?;

        tracing::info!("Dispatching task {} ({})", id, task.tool());
        self.events.emit(EventKind::TaskDispatched {
            round,
            task: id,
            tool: task.tool().to_string(),
        });

        Ok(Dispatch {
            round,
            id,
            tool,
            input,
            timeout: self.task_timeout,
            retry: self.retry,
            events: self.events.clone(),
        })
    }

    /// Record a terminal outcome, unblock dependents and record skips.
    fn apply(
        &self,
        round: u32,
        fetcher: &mut TaskFetchingUnit,
        store: &mut ResultStore,
        completion: Completion,
    ) -> Result<(), EngineError> {
        let Completion { id, outcome, attempts } = completion;

        let (status, error) = match &outcome {
            TaskOutcome::Succeeded { .. } => {
                tracing::info!("Task {} succeeded after {} attempt(s)", id, attempts);
                (TaskStatus::Succeeded, None)
            }
            TaskOutcome::Failed { failure } => {
                tracing::warn!("Task {} failed: {}", id, failure);
                (TaskStatus::Failed, Some(failure.to_string()))
            }
            TaskOutcome::Skipped => (TaskStatus::Skipped, None),
        };

        store.record(id, outcome.clone())?;
        let skipped = fetcher.on_task_completed(id, &outcome)?;
        self.events.emit(EventKind::TaskCompleted {
            round,
            task: id,
            status,
            error,
        });

        for skipped_id in skipped {
            store.record(skipped_id, TaskOutcome::Skipped)?;
            tracing::info!("Task {} skipped", skipped_id);
            self.events.emit(EventKind::TaskSkipped {
                round,
                task: skipped_id,
            });
        }
        Ok(())
    }

    /// Stop dispatching and let running workers finish unobserved.
    fn interrupt(
        &self,
        round: u32,
        fetcher: &mut TaskFetchingUnit,
        mut workers: JoinSet<Completion>,
        timed_out: bool,
    ) -> RoundExecution {
        fetcher.cancel();
        let abandoned: Vec<TaskId> = fetcher.in_flight().iter().copied().collect();

        if timed_out {
            tracing::warn!(
                "Round {} timed out with {} task(s) still running",
                round,
                abandoned.len()
            );
            self.events.emit(EventKind::RoundTimedOut {
                round,
                in_flight: abandoned.clone(),
            });
        } else {
            tracing::info!("Round {} cancelled", round);
        }

        if !workers.is_empty() {
            tokio::spawn(async move {
                while let Some(joined) = workers.join_next().await {
                    if let Ok(completion) = joined {
                        tracing::debug!("Discarding late result of task {}", completion.id);
                    }
                }
            });
        }

        RoundExecution {
            timed_out,
            cancelled: !timed_out,
            abandoned,
        }
    }
}

/// Invoke one tool with timeout and bounded retries.
async fn run_worker(dispatch: Dispatch) -> Completion {
    let Dispatch {
        round,
        id,
        tool,
        input,
        timeout,
        retry,
        events,
    } = dispatch;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let call = AssertUnwindSafe(tool.invoke(input.clone())).catch_unwind();

        let (kind, message, transient) = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(value))) => {
                return Completion {
                    id,
                    outcome: TaskOutcome::Succeeded { value },
                    attempts: attempt,
                };
            }
            Ok(Ok(Err(e))) => (TaskFailureKind::ToolInvocation, e.to_string(), e.is_transient()),
            Ok(Err(_)) => (
                TaskFailureKind::ToolInvocation,
                format!("Tool '{}' panicked", tool.name()),
                false,
            ),
            Err(_) => (
                TaskFailureKind::Timeout,
                format!("No result within {:?}", timeout),
                true,
            ),
        };

        if !retry.should_retry(attempt, transient) {
            return Completion {
                id,
                outcome: TaskOutcome::Failed {
                    failure: TaskFailure::new(kind, message, attempt),
                },
                attempts: attempt,
            };
        }

        let delay = retry.delay_for(attempt);
        tracing::warn!(
            "Task {} attempt {} failed ({}), retrying in {:?}",
            id,
            attempt,
            message,
            delay
        );
        events.emit(EventKind::TaskRetrying {
            round,
            task: id,
            attempt,
            error: message,
        });
        tokio::time::sleep(delay).await;
    }
}

/// Substitute every reference of `task` with the stored result.
///
/// Failed or skipped dependencies resolve to `null`. A dependency with no
/// store entry yields its id as the error.
fn resolve_arguments(task: &Task, store: &ResultStore) -> Result<ToolInput, TaskId> {
    let mut input = ToolInput::new();
    for argument in task.arguments() {
        let value = resolve_value(&argument.value, store)?;
        match &argument.name {
            Some(name) => input.insert_named(name.clone(), value),
            None => input.push_positional(value),
        }
    }
    Ok(input)
}

fn resolve_value(value: &ArgValue, store: &ResultStore) -> Result<Value, TaskId> {
    match value {
        ArgValue::Literal(literal) => Ok(literal.clone()),
        ArgValue::Reference(id) => lookup(*id, store),
        ArgValue::Template(fragments) => {
            let mut rendered = String::new();
            for fragment in fragments {
                match fragment {
                    Fragment::Text(text) => rendered.push_str(text),
                    Fragment::Reference(id) => rendered.push_str(&render_text(&lookup(*id, store)?)),
                }
            }
            Ok(Value::String(rendered))
        }
        ArgValue::List(items) => items
            .iter()
            .map(|item| resolve_value(item, store))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
    }
}

fn lookup(id: TaskId, store: &ResultStore) -> Result<Value, TaskId> {
    match store.get(id) {
        Some(TaskOutcome::Succeeded { value }) => Ok(value.clone()),
        Some(_) => Ok(Value::Null),
        None => Err(id),
    }
}

/// Text form of a result when spliced into a string.
pub(crate) fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
