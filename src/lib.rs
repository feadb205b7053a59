//! # plangraph
//!
//! Parallel task-graph execution engine.
//!
//! A planner turns a goal into a numbered plan of tool calls. The plan is
//! parsed into a DAG whose ready tasks run concurrently on a bounded worker
//! pool, with results substituted into dependent tasks. A joiner then either
//! finishes with an answer or starts another planning round.
//!
//! ## Architecture
//!
//! ```text
//!   goal ─▶ Planner ─▶ PlanParser ─▶ Plan (DAG)
//!              ▲                        │
//!              │ Replan(context)        ▼
//!              │                  TaskFetchingUnit ◀──┐
//!              │                        │ ready ids   │ on_task_completed
//!              │                        ▼             │
//!              │                    Executor ─────────┤
//!              │                  (W workers)         │
//!              │                        │             │
//!              │                        ▼             │
//!              │                   ResultStore ───────┘
//!              │                        │ join ready / round timeout
//!              │                        ▼
//!              └─────────────────── Joiner ─▶ Finish(answer)
//! ```
//!
//! ## Modules
//! - `plan`: task model and plan parser
//! - `engine`: fetching unit, executor, joiner, orchestrator loop
//! - `capability`: planner and synthesizer interfaces, LLM-backed versions
//! - `tools`: tool interface, registry and built-in web tools
//! - `llm`: OpenRouter chat client
//! - `config`: environment configuration

pub mod capability;
pub mod config;
pub mod engine;
pub mod llm;
pub mod plan;
pub mod tools;

pub use capability::{CapabilityError, LlmPlanner, LlmSynthesizer, Planner, Synthesizer, Verdict};
pub use config::{Config, EngineConfig, ExhaustionPolicy, FailurePolicy};
pub use engine::{EngineError, EngineEvent, Orchestrator, RunOutcome, RunStatus};
pub use plan::{Plan, PlanParser};
pub use tools::{Tool, ToolError, ToolInput, ToolRegistry};
