//! Tool capability: the named actions a plan can invoke.
//!
//! The engine only knows tools through the [`Tool`] trait and looks them up
//! by name in a [`ToolRegistry`] built once before execution. What a tool
//! does is entirely up to its implementation.

mod web;

pub use web::{FetchUrl, WebSearch};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

/// Information about a tool for display and planner prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Error returned by a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// Arguments were missing or of the wrong shape; retrying cannot help
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The tool ran and failed; may succeed on retry
    #[error("Tool failed: {0}")]
    Failed(String),

    /// The tool cannot run in this environment (missing credentials etc.)
    #[error("Tool unavailable: {0}")]
    Unavailable(String),
}

impl ToolError {
    /// Check if retrying the same invocation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Failed(_))
    }
}

/// Fully resolved arguments of one invocation.
///
/// Positional and keyword arguments keep the order the planner wrote them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolInput {
    positional: Vec<Value>,
    named: Map<String, Value>,
}

impl ToolInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_positional(&mut self, value: Value) {
        self.positional.push(value);
    }

    pub fn insert_named(&mut self, name: impl Into<String>, value: Value) {
        self.named.insert(name.into(), value);
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named(&self) -> &Map<String, Value> {
        &self.named
    }

    /// Look up an argument by keyword, falling back to its position.
    pub fn get(&self, name: &str, position: usize) -> Option<&Value> {
        self.named
            .get(name)
            .or_else(|| self.positional.get(position))
    }

    /// Like [`ToolInput::get`], rendering non-string values as JSON text.
    pub fn text(&self, name: &str, position: usize) -> Result<String, ToolError> {
        match self.get(name, position) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => {
                Err(ToolError::InvalidInput(format!("Missing '{}' argument", name)))
            }
            Some(other) => Ok(other.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name plans use to call this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does, shown to the planner.
    fn description(&self) -> &str;

    /// Run the tool. Timeouts are enforced by the caller.
    async fn invoke(&self, input: ToolInput) -> Result<Value, ToolError>;
}

/// Registry of available tools.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new registry with the built-in web tools.
    pub fn new() -> Self {
        Self::empty()
            .with_tool(Arc::new(WebSearch))
            .with_tool(Arc::new(FetchUrl))
    }

    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Add a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            tracing::warn!("Tool '{}' registered twice; keeping the latest", name);
        }
        previous
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// List all available tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
