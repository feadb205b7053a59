//! plangraph - command line entry point
//!
//! Runs one goal through the planning loop and prints the answer.
//! Usage: `plangraph [goal...]`

use std::sync::Arc;

use plangraph::config::Config;
use plangraph::engine::{EngineEvent, EventKind, Orchestrator, RunStatus};
use plangraph::llm::{LlmClient, OpenRouterClient};
use plangraph::{LlmPlanner, LlmSynthesizer, ToolRegistry};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_GOAL: &str = "Plan a trip to Cabo for 8 people, under $1500/person, 5 nights, 6 days.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plangraph=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, workers={}, rounds={}",
        config.default_model, config.engine.max_workers, config.engine.max_rounds
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let goal = if args.is_empty() {
        DEFAULT_GOAL.to_string()
    } else {
        args.join(" ")
    };

    let client: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(config.api_key.clone()));
    let tools = ToolRegistry::new();
    let planner = LlmPlanner::new(client.clone(), &config.default_model, &tools.list_tools());
    let synthesizer = LlmSynthesizer::new(client, &config.default_model);

    let (events_tx, events_rx) = broadcast::channel(256);
    tokio::spawn(log_events(events_rx));

    let orchestrator = Orchestrator::new(
        Arc::new(planner),
        Arc::new(synthesizer),
        tools,
        config.engine.clone(),
    )
    .with_events(events_tx);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run(&goal, None).await;

    match outcome.status {
        RunStatus::Finished | RunStatus::PartialFinished => {
            if outcome.status == RunStatus::PartialFinished {
                println!("(partial answer: planning rounds exhausted)\n");
            }
            println!("{}", outcome.answer.unwrap_or_default());
            Ok(())
        }
        RunStatus::Failed => {
            if !outcome.context.is_empty() {
                eprintln!("Last context:\n{}", outcome.context);
            }
            Err(anyhow::anyhow!(
                "run failed: {}",
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            ))
        }
    }
}

/// Log a one-line trace per engine event.
async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event.kind {
                EventKind::TaskRetrying { task, attempt, error, .. } => {
                    warn!("task {} retry after attempt {}: {}", task, attempt, error)
                }
                EventKind::RunFinished { .. } => {
                    info!("event: {}", serde_json::to_string(&event).unwrap_or_default());
                    break;
                }
                _ => tracing::debug!("event: {}", serde_json::to_string(&event).unwrap_or_default()),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Event logger lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
