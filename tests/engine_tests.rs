//! End-to-end runs of the plan → execute → join loop against instrumented tools.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    registry, CallLog, ConcatSynthesizer, FlakyTool, RecordingTool, ScriptedPlanner, SilentPlanner,
};
use plangraph::engine::{EngineEvent, EventKind, RetryPolicy};
use plangraph::plan::TaskStatus;
use plangraph::{
    EngineConfig, ExhaustionPolicy, FailurePolicy, Orchestrator, RunOutcome, RunStatus,
    ToolRegistry,
};
use tokio::sync::broadcast;

const GOAL: &str = "Plan a trip to Cabo";

const CABO_PLAN: &str = r#"Thought: Beaches and prices do not depend on each other.
1. search("best beaches Cabo")
2. search("Cabo hotel prices")
3. join()
"#;

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_max_workers(4)
        .with_retry(RetryPolicy::none())
}

async fn run(planner: Arc<ScriptedPlanner>, tools: ToolRegistry, config: EngineConfig) -> RunOutcome {
    Orchestrator::new(planner, Arc::new(ConcatSynthesizer), tools, config)
        .run(GOAL, None)
        .await
}

fn statuses(outcome: &RunOutcome) -> Vec<Vec<TaskStatus>> {
    outcome
        .rounds
        .iter()
        .map(|r| r.summary.tasks().iter().map(|t| t.status).collect())
        .collect()
}

#[tokio::test]
async fn test_engine_cabo_plan_runs_searches_in_parallel() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&[CABO_PLAN]);

    let outcome = run(planner.clone(), registry(&log), config().with_max_workers(2)).await;

    assert_eq!(outcome.status, RunStatus::Finished);
    assert_eq!(
        outcome.answer.as_deref(),
        Some("Plan a trip to Cabo: search(best beaches Cabo); search(Cabo hotel prices)")
    );
    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(planner.calls(), 1);

    let beaches = log.find("best beaches Cabo");
    let prices = log.find("Cabo hotel prices");
    assert!(beaches.overlaps(&prices), "independent searches should overlap");
}

#[tokio::test]
async fn test_engine_dependent_task_waits_for_its_inputs() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&[
        "1. search(\"flights\")\n2. search(\"hotels\")\n3. summarize(\"$1 and $2\")\n4. join()",
    ]);

    let outcome = run(planner, registry(&log), config()).await;

    assert_eq!(outcome.status, RunStatus::Finished);
    let summary = log.find("search(flights) and search(hotels)");
    assert!(summary.started >= log.find("flights").ended);
    assert!(summary.started >= log.find("hotels").ended);
    assert!(outcome
        .answer
        .unwrap()
        .ends_with("summarize(search(flights) and search(hotels))"));
}

#[tokio::test]
async fn test_engine_single_worker_runs_one_task_at_a_time() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&["1. search(\"a\")\n2. search(\"b\")\n3. search(\"c\")\n4. join()"]);

    let outcome = run(planner, registry(&log), config().with_max_workers(1)).await;

    assert_eq!(outcome.status, RunStatus::Finished);
    let calls = log.calls();
    assert_eq!(calls.len(), 3);
    for (i, a) in calls.iter().enumerate() {
        for b in &calls[i + 1..] {
            assert!(!a.overlaps(b), "{} overlapped {}", a.input, b.input);
        }
    }
    let order: Vec<&str> = calls.iter().map(|c| c.input.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_engine_unknown_reference_rejected_before_dispatch() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&["1. search(\"a\")\n2. search($5)\n3. join()"]);

    let outcome = run(planner.clone(), registry(&log), config().with_max_plan_attempts(2)).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.unwrap().contains("references $5"));
    assert!(log.calls().is_empty(), "no task may run from a rejected plan");
    assert_eq!(planner.calls(), 2);
    assert!(planner.contexts()[1].contains("which does not exist"));
}

#[tokio::test]
async fn test_engine_failure_skips_dependents_and_replans() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&[
        "1. call(\"555-0100\")\n2. summarize($1)\n3. search(\"weather\")\n4. join()",
    ]);

    let outcome = run(
        planner.clone(),
        registry(&log),
        config()
            .with_max_rounds(2)
            .with_exhaustion_policy(ExhaustionPolicy::Fail),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.max_rounds_exceeded);
    assert_eq!(planner.calls(), 2);
    assert_eq!(outcome.rounds.len(), 2);
    assert!(log.calls_to("summarize").is_empty());
    assert_eq!(log.calls_to("search").len(), 2);

    assert_eq!(
        statuses(&outcome)[0],
        vec![TaskStatus::Failed, TaskStatus::Skipped, TaskStatus::Succeeded]
    );
    let context = &planner.contexts()[1];
    assert!(context.contains("call -> failed"));
    assert!(context.contains("search(weather)"));
}

#[tokio::test]
async fn test_engine_exhaustion_returns_partial_answer() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&["1. call(\"x\")\n2. search(\"fallback\")\n3. join()"]);

    let outcome = run(planner.clone(), registry(&log), config().with_max_rounds(3)).await;

    assert_eq!(outcome.status, RunStatus::PartialFinished);
    assert!(outcome.max_rounds_exceeded);
    assert_eq!(planner.calls(), 3);
    assert_eq!(outcome.answer.as_deref(), Some("Plan a trip to Cabo: search(fallback)"));
}

#[tokio::test]
async fn test_engine_partial_answer_keeps_earlier_rounds() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&[
        "1. search(\"beaches\")\n2. call(\"x\")\n3. join()",
        "1. call(\"y\")\n2. join()",
    ]);

    let outcome = run(planner.clone(), registry(&log), config().with_max_rounds(2)).await;

    assert_eq!(outcome.status, RunStatus::PartialFinished);
    assert!(outcome.max_rounds_exceeded);
    assert_eq!(planner.calls(), 2);
    assert_eq!(statuses(&outcome)[1], vec![TaskStatus::Failed]);
    assert_eq!(outcome.answer.as_deref(), Some("Plan a trip to Cabo: search(beaches)"));
}

#[tokio::test]
async fn test_engine_unresponsive_planner_ends_the_run() {
    let log = CallLog::default();
    let orchestrator = Orchestrator::new(
        Arc::new(SilentPlanner),
        Arc::new(ConcatSynthesizer),
        registry(&log),
        config()
            .with_round_timeout(Duration::from_millis(100))
            .with_capability_timeout(Duration::from_millis(100)),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(3), orchestrator.run(GOAL, Some("notes")))
        .await
        .expect("run should not hang");

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.unwrap().contains("Planner gave no response"));
    assert_eq!(outcome.context, "notes");
    assert!(log.calls().is_empty());
}

#[tokio::test]
async fn test_engine_best_effort_passes_null_for_failed_inputs() {
    let log = CallLog::default();
    let planner = ScriptedPlanner::new(&["1. call(\"x\")\n2. summarize($1)\n3. join()"]);

    let outcome = run(
        planner,
        registry(&log),
        config()
            .with_max_rounds(1)
            .with_failure_policy(FailurePolicy::BestEffort),
    )
    .await;

    let summarize = log.calls_to("summarize");
    assert_eq!(summarize.len(), 1);
    assert_eq!(summarize[0].input, "null");
    assert_eq!(statuses(&outcome)[0], vec![TaskStatus::Failed, TaskStatus::Succeeded]);
    assert_eq!(outcome.status, RunStatus::PartialFinished);
}

#[tokio::test]
async fn test_engine_round_timeout_reports_unfinished_tasks() {
    let log = CallLog::default();
    let tools = registry(&log).with_tool(Arc::new(RecordingTool::new(
        "crawl",
        Duration::from_secs(5),
        &log,
    )));
    let planner = ScriptedPlanner::new(&["1. search(\"quick\")\n2. crawl(\"everything\")\n3. join()"]);

    let started = Instant::now();
    let outcome = run(
        planner,
        tools,
        config()
            .with_max_rounds(1)
            .with_round_timeout(Duration::from_millis(200)),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.status, RunStatus::PartialFinished);
    assert_eq!(outcome.answer.as_deref(), Some("Plan a trip to Cabo: search(quick)"));

    let summary = &outcome.rounds[0].summary;
    assert!(summary.timed_out());
    let unfinished: Vec<u32> = summary.unfinished().map(|t| t.id.get()).collect();
    assert_eq!(unfinished, vec![2]);
}

#[tokio::test]
async fn test_engine_transient_failures_are_retried() {
    let log = CallLog::default();
    let flaky = FlakyTool::new("quote", 2);
    let tools = registry(&log).with_tool(flaky.clone());
    let planner = ScriptedPlanner::new(&["1. quote(\"CABO\")\n2. join()"]);

    let outcome = run(
        planner,
        tools,
        config().with_retry(RetryPolicy::exponential(3, Duration::from_millis(5))),
    )
    .await;

    assert_eq!(outcome.status, RunStatus::Finished);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(outcome.answer.as_deref(), Some("Plan a trip to Cabo: quote ok after 3 calls"));
}

#[tokio::test]
async fn test_engine_repeated_runs_agree() {
    let plan = "1. search(\"a\")\n2. search(\"b\")\n3. summarize(\"$1 + $2\")\n4. call($3)\n5. join()";

    let first = run(
        ScriptedPlanner::new(&[plan]),
        registry(&CallLog::default()),
        config().with_max_rounds(2),
    )
    .await;
    let second = run(
        ScriptedPlanner::new(&[plan]),
        registry(&CallLog::default()),
        config().with_max_rounds(2),
    )
    .await;

    assert_eq!(first.status, second.status);
    assert_eq!(first.answer, second.answer);
    assert_eq!(statuses(&first), statuses(&second));
    assert_eq!(first.context, second.context);
}

#[tokio::test]
async fn test_engine_events_trace_the_run() {
    let log = CallLog::default();
    let (tx, mut rx) = broadcast::channel::<EngineEvent>(64);
    let orchestrator = Orchestrator::new(
        ScriptedPlanner::new(&[CABO_PLAN]),
        Arc::new(ConcatSynthesizer),
        registry(&log),
        config(),
    )
    .with_events(tx);

    let outcome = orchestrator.run(GOAL, None).await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.run_id, outcome.run_id);
        events.push(event.kind);
    }
    let dispatched = events
        .iter()
        .filter(|e| matches!(e, EventKind::TaskDispatched { .. }))
        .count();
    assert_eq!(dispatched, 2);
    assert!(matches!(events.first(), Some(EventKind::RoundStarted { round: 1 })));
    assert!(matches!(
        events.last(),
        Some(EventKind::RunFinished {
            status: RunStatus::Finished,
            rounds: 1
        })
    ));
}

#[test]
fn test_engine_cancelled_run_dispatches_nothing() {
    let log = CallLog::default();
    let orchestrator = Orchestrator::new(
        ScriptedPlanner::new(&[CABO_PLAN]),
        Arc::new(ConcatSynthesizer),
        registry(&log),
        config(),
    );
    orchestrator.cancel_token().cancel();

    let outcome = tokio_test::block_on(orchestrator.run(GOAL, Some("earlier notes")));

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error.as_deref(), Some("Run cancelled"));
    assert_eq!(outcome.context, "earlier notes");
    assert!(log.calls().is_empty());
}
