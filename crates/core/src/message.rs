//! Message domain types.
//!
//! A [`Message`] is one conversation unit: a role plus an ordered list of
//! content blocks. Assistant messages may carry `tool_use` blocks; each of
//! those is answered by exactly one `Role::Tool` message whose
//! `tool_call_id` matches the block id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolInvocationRequest, ToolResult, ToolStatus};

/// Metadata key marking a synthetic summary message.
pub const SUMMARY_METADATA_KEY: &str = "summary";

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

/// A block of a tool result: plain text or structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultBlock {
    Text { text: String },
    Json { value: serde_json::Value },
}

impl ResultBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ResultBlock::Text { text: text.into() }
    }

    /// Render this block as text (JSON is serialized compactly).
    pub fn to_text(&self) -> String {
        match self {
            ResultBlock::Text { text } => text.clone(),
            ResultBlock::Json { value } => value.to_string(),
        }
    }
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        status: ToolStatus,
        content: Vec<ResultBlock>,
    },
    Json {
        value: serde_json::Value,
    },
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Ordered content blocks
    pub content: Vec<ContentBlock>,

    /// Present iff this is a tool result or the content invokes a tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_blocks(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_call_id: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    fn text_blocks(text: String) -> Vec<ContentBlock> {
        if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentBlock::Text { text }]
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_blocks(Role::User, Self::text_blocks(content.into()))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_blocks(Role::Assistant, Self::text_blocks(content.into()))
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_blocks(Role::System, Self::text_blocks(content.into()))
    }

    /// Create an assistant message that invokes one or more tools.
    ///
    /// `tool_call_id` is set to the first invocation's id.
    pub fn tool_use(text: impl Into<String>, requests: &[ToolInvocationRequest]) -> Self {
        let mut content = Self::text_blocks(text.into());
        content.extend(requests.iter().map(|r| ContentBlock::ToolUse {
            id: r.tool_call_id.clone(),
            name: r.tool_name.clone(),
            input: r.input.clone(),
        }));
        let mut msg = Self::with_blocks(Role::Assistant, content);
        msg.tool_call_id = requests.first().map(|r| r.tool_call_id.clone());
        msg
    }

    /// Create a tool result message answering one invocation.
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::with_blocks(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_call_id: result.tool_call_id.clone(),
                status: result.status,
                content: result.content.clone(),
            }],
        );
        msg.tool_call_id = Some(result.tool_call_id.clone());
        msg
    }

    /// Create a synthetic summary message standing in for folded history.
    pub fn summary(text: impl Into<String>) -> Self {
        Self::user(text).with_metadata(SUMMARY_METADATA_KEY, serde_json::Value::Bool(true))
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Concatenated text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text } => out.push_str(text),
                ContentBlock::Json { value } => out.push_str(&value.to_string()),
                ContentBlock::ToolResult { content, .. } => {
                    for b in content {
                        out.push_str(&b.to_text());
                    }
                }
                ContentBlock::ToolUse { .. } => {}
            }
        }
        out
    }

    /// Ids of the tool invocations this message makes.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }

    pub fn is_summary(&self) -> bool {
        self.metadata
            .get(SUMMARY_METADATA_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Rough size of the message body in characters, used for token estimates.
    pub fn char_len(&self) -> usize {
        self.content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::Json { value } => value.to_string().len(),
                ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => {
                    content.iter().map(|c| c.to_text().len()).sum()
                }
            })
            .sum()
    }
}
