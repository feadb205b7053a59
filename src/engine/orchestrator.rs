//! Orchestrator loop: bounded plan → execute → join → replan rounds.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityError, Planner, Synthesizer};
use crate::config::{EngineConfig, ExhaustionPolicy};
use crate::plan::{Plan, PlanParser};
use crate::tools::ToolRegistry;

use super::events::{EngineEvent, EventKind, EventSink, RunId};
use super::executor::Executor;
use super::fetching::TaskFetchingUnit;
use super::joiner::{JoinDecision, Joiner, RoundSummary};
use super::store::ResultStore;
use super::EngineError;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    /// Rounds ran out; the answer covers whatever succeeded in any round
    PartialFinished,
    Failed,
}

/// What happened in one executed round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: u32,
    /// Planner calls needed to get a parseable plan
    pub plan_attempts: u32,
    pub summary: RoundSummary,
    pub replanned: bool,
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub answer: Option<String>,
    /// Accumulated context at the end of the run
    pub context: String,
    pub rounds: Vec<RoundReport>,
    pub error: Option<String>,
    pub max_rounds_exceeded: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status != RunStatus::Failed
    }
}

/// Mutable state carried across rounds. Nothing else survives a round.
struct RunState {
    context: String,
    rounds: Vec<RoundReport>,
}

impl RunState {
    fn fold(&mut self, round_context: String) {
        if self.context.trim().is_empty() {
            self.context = round_context;
        } else {
            self.context = format!("{}\n\n{}", self.context.trim_end(), round_context);
        }
    }
}

/// Drives whole runs for a fixed planner, synthesizer and tool set.
pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    joiner: Joiner,
    tools: Arc<ToolRegistry>,
    parser: PlanParser,
    config: EngineConfig,
    events: Option<broadcast::Sender<EngineEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Plans are checked against the registry's tool names.
    pub fn new(
        planner: Arc<dyn Planner>,
        synthesizer: Arc<dyn Synthesizer>,
        tools: ToolRegistry,
        config: EngineConfig,
    ) -> Self {
        let parser = PlanParser::with_known_tools(tools.names());
        Self {
            planner,
            joiner: Joiner::new(synthesizer),
            tools: Arc::new(tools),
            parser,
            config,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Broadcast progress events on `sender`.
    pub fn with_events(mut self, sender: broadcast::Sender<EngineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Stop runs when `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `goal` to a terminal outcome.
    ///
    /// Never returns an error: failures become `RunStatus::Failed` with the
    /// last context snapshot.
    pub async fn run(&self, goal: &str, prior_context: Option<&str>) -> RunOutcome {
        let run_id = RunId::new();
        let events = EventSink::new(run_id, self.events.clone());
        let mut state = RunState {
            context: prior_context.unwrap_or_default().to_string(),
            rounds: Vec::new(),
        };

        tracing::info!("Run {} started: {}", run_id, goal);
        let result = self.drive(goal, &events, &mut state).await;

        let (status, answer, error, max_rounds_exceeded) = match result {
            Ok((status, answer)) => (status, Some(answer), None, status == RunStatus::PartialFinished),
            Err(e) => {
                tracing::error!("Run {} failed: {}", run_id, e);
                let exceeded = matches!(e, EngineError::MaxRoundsExceeded(_));
                (RunStatus::Failed, None, Some(e.to_string()), exceeded)
            }
        };

        let rounds = state.rounds.len() as u32;
        tracing::info!("Run {} ended {:?} after {} round(s)", run_id, status, rounds);
        events.emit(EventKind::RunFinished { status, rounds });

        RunOutcome {
            run_id,
            status,
            answer,
            context: state.context,
            rounds: state.rounds,
            error,
            max_rounds_exceeded,
        }
    }

    async fn drive(
        &self,
        goal: &str,
        events: &EventSink,
        state: &mut RunState,
    ) -> Result<(RunStatus, String), EngineError> {
        let executor = Executor::new(self.tools.clone(), &self.config, events.clone());

        for round in 1..=self.config.max_rounds {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            tracing::info!("Starting round {}/{}", round, self.config.max_rounds);
            events.emit(EventKind::RoundStarted { round });

            let (plan, plan_attempts) = self.plan_round(goal, round, &state.context, events).await?;

            let mut fetcher = TaskFetchingUnit::initialize(plan, self.config.failure_policy)?;
            let mut store = ResultStore::new();
            let deadline = Instant::now() + self.config.round_timeout;
            let execution = executor
                .run_round(round, &mut fetcher, &mut store, deadline, &self.cancel)
                .await?;
            if execution.cancelled {
                return Err(EngineError::Cancelled);
            }

            let summary = RoundSummary::collect(round, &fetcher, &store, &execution);
            let decision = self
                .bounded("Synthesizer", self.joiner.decide(goal, &summary))
                .await?
                .map_err(EngineError::Synthesis)?;

            let finish = matches!(decision, JoinDecision::Finish { .. });
            tracing::info!(
                "Round {}: {} succeeded, {} failed, {} skipped, {} unfinished -> {}",
                round,
                summary.succeeded().count(),
                summary.failed().count(),
                summary.skipped().count(),
                summary.unfinished().count(),
                if finish { "finish" } else { "replan" }
            );
            events.emit(EventKind::JoinDecided { round, finish });

            state.rounds.push(RoundReport {
                round,
                plan_attempts,
                summary: summary.clone(),
                replanned: !finish,
            });

            match decision {
                JoinDecision::Finish { answer } => return Ok((RunStatus::Finished, answer)),
                JoinDecision::Replan { context } => state.fold(context),
            }
        }

        tracing::warn!("Exhausted {} round(s) without a final answer", self.config.max_rounds);
        let exhausted = EngineError::MaxRoundsExceeded(self.config.max_rounds);
        match self.config.exhaustion_policy {
            ExhaustionPolicy::PartialAnswer => {
                let summaries = state.rounds.iter().map(|r| &r.summary);
                match self
                    .bounded("Synthesizer", self.joiner.partial_answer(goal, summaries))
                    .await?
                    .map_err(EngineError::Synthesis)?
                {
                    Some(answer) => Ok((RunStatus::PartialFinished, answer)),
                    None => Err(exhausted),
                }
            }
            ExhaustionPolicy::Fail => Err(exhausted),
        }
    }

    /// Ask the planner until its text parses, feeding parse errors back.
    async fn plan_round(
        &self,
        goal: &str,
        round: u32,
        context: &str,
        events: &EventSink,
    ) -> Result<(Plan, u32), EngineError> {
        let mut attempt = 0;
        let mut prompt_context = context.to_string();

        loop {
            attempt += 1;
            let text = self
                .bounded("Planner", self.planner.plan(goal, &prompt_context))
                .await?
                .map_err(EngineError::Planning)?;

            match self.parser.parse(&text) {
                Ok(plan) => {
                    tracing::info!(
                        "Round {} plan parsed on attempt {}: {} task(s)",
                        round,
                        attempt,
                        plan.len()
                    );
                    events.emit(EventKind::PlanParsed {
                        round,
                        attempt,
                        tasks: plan.len(),
                    });
                    return Ok((plan.with_trigger(round, goal, context), attempt));
                }
                Err(error) => {
                    tracing::warn!("Round {} plan attempt {} rejected: {}", round, attempt, error);
                    events.emit(EventKind::PlanRejected {
                        round,
                        attempt,
                        error: error.to_string(),
                    });
                    if attempt >= self.config.max_plan_attempts {
                        return Err(EngineError::PlanRejected {
                            attempts: attempt,
                            last: error,
                        });
                    }
                    prompt_context = format!(
                        "{}\n\nYour previous plan was rejected: {}. Follow the plan format exactly.",
                        context.trim_end(),
                        error
                    )
                    .trim_start()
                    .to_string();
                }
            }
        }
    }

    /// Await a capability call for at most `capability_timeout`, unless the
    /// run is cancelled first. Expiry is `CapabilityError::Unavailable`.
    async fn bounded<T>(
        &self,
        name: &str,
        call: impl Future<Output = Result<T, CapabilityError>>,
    ) -> Result<Result<T, CapabilityError>, EngineError> {
        let limit = self.config.capability_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(limit, call) => Ok(result.unwrap_or_else(|_| {
                tracing::warn!("{} gave no response within {:?}", name, limit);
                Err(CapabilityError::Unavailable(format!(
                    "{} gave no response within {:?}",
                    name, limit
                )))
            })),
        }
    }
}
