//! Deterministic planners, synthesizers and tools for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{CapabilityError, Planner, Synthesizer, Verdict};
use crate::tools::{Tool, ToolError, ToolInput};

use super::RoundSummary;

/// Replays plan texts in order, repeating the last one.
pub struct ScriptedPlanner {
    plans: Vec<String>,
    contexts: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    pub fn new<I, S>(plans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            plans: plans.into_iter().map(Into::into).collect(),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Context passed on each call so far.
    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _goal: &str, context: &str) -> Result<String, CapabilityError> {
        let mut contexts = self.contexts.lock().unwrap();
        let index = contexts.len().min(self.plans.len().saturating_sub(1));
        contexts.push(context.to_string());
        self.plans
            .get(index)
            .cloned()
            .ok_or_else(|| CapabilityError::Unavailable("no scripted plans".to_string()))
    }
}

/// Fixed answer; verdicts are replayed, then default to replanning.
pub struct ScriptedSynthesizer {
    answer: String,
    verdicts: Mutex<VecDeque<Verdict>>,
}

impl ScriptedSynthesizer {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            verdicts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_verdicts(self, verdicts: Vec<Verdict>) -> Self {
        *self.verdicts.lock().unwrap() = verdicts.into();
        self
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, _goal: &str, _summary: &RoundSummary) -> Result<String, CapabilityError> {
        Ok(self.answer.clone())
    }

    async fn assess(&self, _goal: &str, _summary: &RoundSummary) -> Result<Verdict, CapabilityError> {
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Verdict::Replan { feedback: None }))
    }
}

/// Never answers a planning or synthesis call.
pub struct Unresponsive;

#[async_trait]
impl Planner for Unresponsive {
    async fn plan(&self, _goal: &str, _context: &str) -> Result<String, CapabilityError> {
        std::future::pending().await
    }
}

#[async_trait]
impl Synthesizer for Unresponsive {
    async fn synthesize(&self, _goal: &str, _summary: &RoundSummary) -> Result<String, CapabilityError> {
        std::future::pending().await
    }
}

/// Returns `"<name>:<text>"` for a single string argument, otherwise the
/// resolved input as JSON (`{"args": [...], <keywords>}`).
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the arguments"
    }

    async fn invoke(&self, input: ToolInput) -> Result<Value, ToolError> {
        if let ([Value::String(text)], true) = (input.positional(), input.named().is_empty()) {
            return Ok(Value::String(format!("{}:{}", self.name, text)));
        }
        let mut object = input.named().clone();
        object.insert("args".to_string(), Value::Array(input.positional().to_vec()));
        Ok(Value::Object(object))
    }
}

/// Sleeps for `ms` milliseconds (keyword or first argument), then returns it.
pub struct SleepTool {
    name: String,
}

impl SleepTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleep for ms milliseconds"
    }

    async fn invoke(&self, input: ToolInput) -> Result<Value, ToolError> {
        let ms = input.get("ms", 0).and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    }
}

/// Fails with a transient error for the first `failures` calls.
pub struct FlakyTool {
    name: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyTool {
    pub fn new(name: &str, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Fails a fixed number of times"
    }

    async fn invoke(&self, _input: ToolInput) -> Result<Value, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ToolError::Failed(format!("{} failure #{}", self.name, call)));
        }
        Ok(json!(format!("{} ok", self.name)))
    }
}
