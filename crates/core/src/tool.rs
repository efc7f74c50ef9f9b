//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are registered by name in a [`ToolRegistry`]. The executor resolves
//! each [`ToolInvocationRequest`] against the registry and turns every
//! outcome, success or failure, into exactly one terminal [`ToolResult`].
//! A tool body may report intermediate [`ToolProgress`] through the
//! [`ProgressReporter`] it is handed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ToolError;
use crate::message::ResultBlock;

/// A model-requested invocation of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    /// Correlation id (matches the model's tool call id)
    pub tool_call_id: String,

    /// Name of the tool to execute
    pub tool_name: String,

    /// Structured arguments
    pub input: serde_json::Value,

    /// When the model requested it
    pub requested_at: DateTime<Utc>,
}

impl ToolInvocationRequest {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
            requested_at: Utc::now(),
        }
    }
}

/// Terminal status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// The terminal result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The invocation this result answers
    pub tool_call_id: String,

    /// Success or error
    pub status: ToolStatus,

    /// Ordered output blocks
    pub content: Vec<ResultBlock>,

    /// When the result was produced
    pub produced_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: Vec<ResultBlock>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            status: ToolStatus::Success,
            content,
            produced_at: Utc::now(),
        }
    }

    pub fn success_text(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::success(tool_call_id, vec![ResultBlock::text(text)])
    }

    /// An error result with a descriptive text block.
    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            status: ToolStatus::Error,
            content: vec![ResultBlock::text(message)],
            produced_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// All blocks rendered as text, joined with newlines.
    pub fn output_text(&self) -> String {
        self.content
            .iter()
            .map(ResultBlock::to_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A non-terminal progress value reported by a running tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProgress {
    pub tool_call_id: String,
    pub data: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

/// Handle a tool body uses to report progress for its own invocation.
///
/// Reports are forwarded immediately; a reporter with no listener drops them.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tool_call_id: String,
    tx: Option<mpsc::UnboundedSender<ToolProgress>>,
}

impl ProgressReporter {
    pub fn new(tool_call_id: impl Into<String>, tx: mpsc::UnboundedSender<ToolProgress>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tx: Some(tx),
        }
    }

    /// A reporter that discards everything.
    pub fn noop(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tx: None,
        }
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn report(&self, data: serde_json::Value) {
        if let Some(tx) = &self.tx {
            // Listener gone means nobody is streaming; progress is best-effort.
            let _ = tx.send(ToolProgress {
                tool_call_id: self.tool_call_id.clone(),
                data,
                produced_at: Utc::now(),
            });
        }
    }
}

/// Where a tool runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolLocation {
    /// Executed in-process by the tool executor.
    #[default]
    Local,
    /// Answered by the client (human-in-the-loop); the turn suspends until
    /// a matching inbound `tool_result` arrives.
    Client,
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn input_schema(&self) -> serde_json::Value;

    /// Where this tool runs. Defaults to in-process.
    fn location(&self) -> ToolLocation {
        ToolLocation::Local
    }

    /// Run the tool. `Err` is converted into an error [`ToolResult`] by the executor.
    async fn invoke(
        &self,
        input: serde_json::Value,
        progress: ProgressReporter,
    ) -> std::result::Result<Vec<ResultBlock>, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// A registry of available tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> std::result::Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Where the named tool runs; unknown tools are treated as local so the
    /// executor reports them as not found.
    pub fn location(&self, name: &str) -> ToolLocation {
        self.tools
            .get(name)
            .map(|t| t.location())
            .unwrap_or_default()
    }

    /// All tool definitions, sorted by name for stable model requests.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
