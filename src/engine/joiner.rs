//! Joiner: turns a finished (or cut short) round into Finish or Replan.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::capability::{CapabilityError, Synthesizer, Verdict};
use crate::plan::{TaskId, TaskStatus};

use super::executor::{render_text, RoundExecution};
use super::fetching::TaskFetchingUnit;
use super::store::ResultStore;

/// Longest rendering of a single result in a replan context.
const MAX_RESULT_CHARS: usize = 2_000;

/// Decision for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    Finish { answer: String },
    /// `context` summarizes the round for the next planning call
    Replan { context: String },
}

/// Final state of one task as the joiner sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub tool: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of a round's work tasks after execution stopped.
///
/// Tasks that never reached a terminal state (round timeout or
/// cancellation) keep their last status and carry no value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSummary {
    round: u32,
    tasks: Vec<TaskReport>,
    timed_out: bool,
}

impl RoundSummary {
    pub fn new(round: u32, tasks: Vec<TaskReport>, timed_out: bool) -> Self {
        Self {
            round,
            tasks,
            timed_out,
        }
    }

    /// Build the summary from execution state. Values come from the store,
    /// so discarded late results never appear.
    pub fn collect(
        round: u32,
        fetcher: &TaskFetchingUnit,
        store: &ResultStore,
        execution: &RoundExecution,
    ) -> Self {
        let tasks = fetcher
            .work_tasks()
            .map(|task| TaskReport {
                id: task.id(),
                tool: task.tool().to_string(),
                status: task.status(),
                rationale: task.rationale().map(str::to_string),
                value: store.value(task.id()).cloned(),
                error: task.failure().map(|f| f.to_string()),
            })
            .collect();

        Self::new(round, tasks, execution.timed_out)
    }

    /// Succeeded tasks of several rounds in round order, renumbered from 1.
    /// A repeat of an earlier tool and value is kept once.
    pub fn merge_successes<'a, I>(rounds: I) -> Self
    where
        I: IntoIterator<Item = &'a RoundSummary>,
    {
        let mut last_round = 0;
        let mut tasks: Vec<TaskReport> = Vec::new();
        for summary in rounds {
            last_round = summary.round;
            for report in summary.succeeded() {
                if tasks.iter().any(|t| t.tool == report.tool && t.value == report.value) {
                    continue;
                }
                let mut report = report.clone();
                report.id = TaskId::new(tasks.len() as u32 + 1);
                tasks.push(report);
            }
        }
        Self::new(last_round, tasks, false)
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn tasks(&self) -> &[TaskReport] {
        &self.tasks
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TaskReport> {
        self.with_status(TaskStatus::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.with_status(TaskStatus::Failed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TaskReport> {
        self.with_status(TaskStatus::Skipped)
    }

    fn with_status(&self, status: TaskStatus) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    /// Tasks cut off by the round ending.
    pub fn unfinished(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.status.is_terminal())
    }

    /// Every work task succeeded within the round.
    pub fn all_succeeded(&self) -> bool {
        !self.timed_out && self.tasks.iter().all(|t| t.status.is_success())
    }

    pub fn has_results(&self) -> bool {
        self.succeeded().next().is_some()
    }

    /// Render the round for a model: one line per task, then the feedback.
    pub fn render(&self, feedback: Option<&str>) -> String {
        let mut out = format!("Round {} results:\n", self.round);

        for task in &self.tasks {
            let _ = write!(out, "{}. {} -> ", task.id, task.tool);
            match task.status {
                TaskStatus::Succeeded => {
                    let value = task.value.as_ref().map(render_text).unwrap_or_default();
                    let _ = write!(out, "succeeded: {}", truncate(&value, MAX_RESULT_CHARS));
                }
                TaskStatus::Failed => {
                    let _ = write!(out, "failed: {}", task.error.as_deref().unwrap_or("unknown error"));
                }
                TaskStatus::Skipped => out.push_str("skipped (a dependency did not succeed)"),
                _ => out.push_str("unfinished (the round ended first)"),
            }
            out.push('\n');
        }

        if self.timed_out {
            out.push_str("The round timed out before all tasks finished.\n");
        }
        if let Some(feedback) = feedback {
            let _ = writeln!(out, "Context from last attempt: {}", feedback);
        }
        out
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Decides Finish or Replan for each round.
pub struct Joiner {
    synthesizer: Arc<dyn Synthesizer>,
}

impl Joiner {
    pub fn new(synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self { synthesizer }
    }

    /// # Decision rule
    /// - Every task succeeded: `Finish` with a synthesized answer
    /// - Otherwise the synthesizer's verdict decides; `Replan` carries the
    ///   rendered round plus its feedback
    pub async fn decide(&self, goal: &str, summary: &RoundSummary) -> Result<JoinDecision, CapabilityError> {
        if summary.all_succeeded() {
            let answer = self.synthesizer.synthesize(goal, summary).await?;
            return Ok(JoinDecision::Finish { answer });
        }

        match self.synthesizer.assess(goal, summary).await? {
            Verdict::Finish { answer: Some(answer) } => Ok(JoinDecision::Finish { answer }),
            Verdict::Finish { answer: None } => {
                let answer = self.synthesizer.synthesize(goal, summary).await?;
                Ok(JoinDecision::Finish { answer })
            }
            Verdict::Replan { feedback } => Ok(JoinDecision::Replan {
                context: summary.render(feedback.as_deref()),
            }),
        }
    }

    /// Best-effort answer once rounds are exhausted, built from whatever
    /// succeeded in any round. `None` when nothing did.
    pub async fn partial_answer<'a, I>(
        &self,
        goal: &str,
        rounds: I,
    ) -> Result<Option<String>, CapabilityError>
    where
        I: IntoIterator<Item = &'a RoundSummary>,
    {
        let merged = RoundSummary::merge_successes(rounds);
        if !merged.has_results() {
            return Ok(None);
        }
        tracing::debug!(
            "Partial answer from {} result(s) up to round {}",
            merged.tasks().len(),
            merged.round()
        );
        self.synthesizer.synthesize(goal, &merged).await.map(Some)
    }
}
