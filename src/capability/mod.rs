//! External capabilities consumed by the engine.
//!
//! The engine never decides *what* to do: a [`Planner`] writes the plan text
//! for each round and a [`Synthesizer`] judges results and writes answers.
//! [`LlmPlanner`] and [`LlmSynthesizer`] back both with a chat model.

mod llm;

pub use llm::{LlmPlanner, LlmSynthesizer};

use async_trait::async_trait;

use crate::engine::RoundSummary;

/// Failure of a planning or synthesis call. Fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Model call failed: {0}")]
    Llm(String),

    #[error("Invalid capability response: {0}")]
    InvalidResponse(String),
}

/// Produces plan text for a goal.
#[async_trait]
pub trait Planner: Send + Sync {
    /// `context` is empty in the first round and carries the history of
    /// earlier rounds (and parse errors) afterwards.
    async fn plan(&self, goal: &str, context: &str) -> Result<String, CapabilityError>;
}

/// Verdict on a round whose tasks did not all succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The failures do not matter for the goal; an answer may come with it
    Finish { answer: Option<String> },
    /// Plan again, optionally telling the planner what went wrong
    Replan { feedback: Option<String> },
}

/// Judges round results and writes the final answer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Write the answer to `goal` from the round's results.
    async fn synthesize(&self, goal: &str, summary: &RoundSummary) -> Result<String, CapabilityError>;

    /// Decide whether an incomplete round is good enough.
    ///
    /// The default always asks for another round.
    async fn assess(&self, _goal: &str, _summary: &RoundSummary) -> Result<Verdict, CapabilityError> {
        Ok(Verdict::Replan { feedback: None })
    }
}
