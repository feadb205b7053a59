//! Shared planners, synthesizers and instrumented tools for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use plangraph::capability::{CapabilityError, Planner, Synthesizer};
use plangraph::engine::RoundSummary;
use plangraph::tools::{Tool, ToolError, ToolInput, ToolRegistry};

/// One observed tool invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub tool: String,
    pub input: String,
    pub started: Instant,
    pub ended: Instant,
}

impl Call {
    pub fn overlaps(&self, other: &Call) -> bool {
        self.started < other.ended && other.started < self.ended
    }
}

/// Shared log of every call made by [`RecordingTool`]s.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.tool == tool).collect()
    }

    /// The call whose input text equals `input`.
    pub fn find(&self, input: &str) -> Call {
        self.calls()
            .into_iter()
            .find(|c| c.input == input)
            .unwrap_or_else(|| panic!("no call with input {:?}", input))
    }
}

/// Sleeps, then returns `"<tool>(<first argument>)"`, or fails if configured to.
pub struct RecordingTool {
    name: String,
    delay: Duration,
    fail: bool,
    log: CallLog,
}

impl RecordingTool {
    pub fn new(name: &str, delay: Duration, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            delay,
            fail: false,
            log: log.clone(),
        }
    }

    pub fn failing(name: &str, log: &CallLog) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Duration::from_millis(5), log)
        }
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Instrumented test tool"
    }

    async fn invoke(&self, input: ToolInput) -> Result<Value, ToolError> {
        let text = match input.get("query", 0) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        let ended = Instant::now();

        self.log.0.lock().unwrap().push(Call {
            tool: self.name.clone(),
            input: text.clone(),
            started,
            ended,
        });

        if self.fail {
            return Err(ToolError::InvalidInput(format!("{} cannot handle {}", self.name, text)));
        }
        Ok(Value::String(format!("{}({})", self.name, text)))
    }
}

/// Registry with a 50ms `search`, a 50ms `summarize` and a failing `call`.
pub fn registry(log: &CallLog) -> ToolRegistry {
    ToolRegistry::empty()
        .with_tool(Arc::new(RecordingTool::new("search", Duration::from_millis(50), log)))
        .with_tool(Arc::new(RecordingTool::new("summarize", Duration::from_millis(50), log)))
        .with_tool(Arc::new(RecordingTool::failing("call", log)))
}

/// Fails with a transient error for the first `failures` calls.
pub struct FlakyTool {
    name: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyTool {
    pub fn new(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures,
            calls: AtomicU32::new(0),
        })
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
        "Fails a fixed number of times before succeeding"
    }

    async fn invoke(&self, _input: ToolInput) -> Result<Value, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ToolError::Failed(format!("upstream hiccup #{}", call)));
        }
        Ok(Value::String(format!("{} ok after {} calls", self.name, call)))
    }
}

/// Replays plan texts in order, repeating the last one, and counts calls.
pub struct ScriptedPlanner {
    plans: Vec<String>,
    contexts: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    pub fn new(plans: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            plans: plans.iter().map(|p| p.to_string()).collect(),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _goal: &str, context: &str) -> Result<String, CapabilityError> {
        let mut contexts = self.contexts.lock().unwrap();
        let index = contexts.len().min(self.plans.len() - 1);
        contexts.push(context.to_string());
        Ok(self.plans[index].clone())
    }
}

/// A planner that never answers.
pub struct SilentPlanner;

#[async_trait]
impl Planner for SilentPlanner {
    async fn plan(&self, _goal: &str, _context: &str) -> Result<String, CapabilityError> {
        std::future::pending().await
    }
}

/// Answers with the succeeded results joined in id order.
pub struct ConcatSynthesizer;

#[async_trait]
impl Synthesizer for ConcatSynthesizer {
    async fn synthesize(&self, goal: &str, summary: &RoundSummary) -> Result<String, CapabilityError> {
        let parts: Vec<String> = summary
            .succeeded()
            .filter_map(|t| t.value.as_ref())
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect();
        Ok(format!("{}: {}", goal, parts.join("; ")))
    }
}
