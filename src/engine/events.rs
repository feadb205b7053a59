//! Progress events broadcast while a run executes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::plan::{TaskId, TaskStatus};

use super::orchestrator::RunStatus;

/// Identifier of one `Orchestrator::run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A timestamped event of one run.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RoundStarted {
        round: u32,
    },
    PlanParsed {
        round: u32,
        attempt: u32,
        tasks: usize,
    },
    PlanRejected {
        round: u32,
        attempt: u32,
        error: String,
    },
    TaskDispatched {
        round: u32,
        task: TaskId,
        tool: String,
    },
    TaskRetrying {
        round: u32,
        task: TaskId,
        attempt: u32,
        error: String,
    },
    TaskCompleted {
        round: u32,
        task: TaskId,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskSkipped {
        round: u32,
        task: TaskId,
    },
    /// The round deadline passed; listed tasks were still running
    RoundTimedOut {
        round: u32,
        in_flight: Vec<TaskId>,
    },
    JoinDecided {
        round: u32,
        finish: bool,
    },
    RunFinished {
        status: RunStatus,
        rounds: u32,
    },
}

/// Sending half of the event stream. Cheap to clone into workers.
///
/// Sending never blocks and never fails the run; events are dropped when
/// nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventSink {
    run_id: RunId,
    sender: Option<broadcast::Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(run_id: RunId, sender: Option<broadcast::Sender<EngineEvent>>) -> Self {
        Self { run_id, sender }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::new(RunId::new(), None)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn emit(&self, kind: EventKind) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(EngineEvent {
                run_id: self.run_id,
                at: Utc::now(),
                kind,
            });
        }
    }
}
