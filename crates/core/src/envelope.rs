//! Event envelope: the typed unit exchanged over a session in both directions.
//!
//! On the wire an envelope is one JSON object:
//!
//! ```json
//! {"id": "…", "timestamp": "…", "type": "content", "payload": {"data": "Hi"}, "metadata": {}}
//! ```
//!
//! `type` selects the shape of `payload`. Unit events (`ping`, `pong`) carry no
//! payload. Envelopes are built once at the point of production and never
//! mutated after they are handed to the outbound queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, ProtocolError};
use crate::message::ResultBlock;
use crate::tool::{ToolInvocationRequest, ToolStatus};

/// Metadata key carrying the turn an outbound event belongs to.
pub const TURN_ID_KEY: &str = "turn_id";

/// Metadata key on a `pong` naming the `ping` it answers.
pub const REPLY_TO_KEY: &str = "reply_to";

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Anything that can sit inside an [`Envelope`].
pub trait EventKind {
    /// The wire `type` tag of this event.
    fn event_type(&self) -> &'static str;
}

/// The canonical envelope around an inbound or outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<E> {
    #[serde(default = "new_id")]
    pub id: String,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: E,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl<E: EventKind> Envelope<E> {
    pub fn new(event: E) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            event,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Tag the envelope with the turn it belongs to.
    pub fn with_turn_id(self, turn_id: &str) -> Self {
        self.with_metadata(TURN_ID_KEY, serde_json::Value::String(turn_id.to_string()))
    }

    pub fn turn_id(&self) -> Option<&str> {
        self.metadata.get(TURN_ID_KEY).and_then(|v| v.as_str())
    }
}

impl<E: Serialize> Envelope<E> {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Envelope<InboundEvent> {
    /// Decode one inbound frame, rejecting it before parsing if it is larger
    /// than `max_bytes`.
    pub fn decode(text: &str, max_bytes: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_bytes {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: max_bytes,
            });
        }

        match serde_json::from_str::<Self>(text) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                // Distinguish a well-formed envelope of the wrong direction from garbage.
                let kind = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
                match kind {
                    Some(kind) if !InboundEvent::TYPES.contains(&kind.as_str()) => {
                        Err(ProtocolError::Unsupported(kind))
                    }
                    _ => Err(ProtocolError::Malformed(e.to_string())),
                }
            }
        }
    }
}

impl Envelope<OutboundEvent> {
    /// A `pong` answering the given `ping` envelope id.
    pub fn pong(reply_to: &str) -> Self {
        Envelope::new(OutboundEvent::Pong).with_metadata(
            REPLY_TO_KEY,
            serde_json::Value::String(reply_to.to_string()),
        )
    }

    /// Whether this event ends a turn's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event, OutboundEvent::End { .. })
    }
}

/// Control actions a client can send while a session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Pause,
    Resume,
}

/// Client → core events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundEvent {
    Chat {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<serde_json::Value>,
    },
    Control {
        action: ControlAction,
    },
    /// The answer to a client-side (human-in-the-loop) tool invocation.
    ToolResult {
        tool_id: String,
        result: serde_json::Value,
        #[serde(default = "default_status")]
        status: ToolStatus,
    },
    Ping,
    Pong,
}

fn default_status() -> ToolStatus {
    ToolStatus::Success
}

impl InboundEvent {
    pub const TYPES: &'static [&'static str] = &["chat", "control", "tool_result", "ping", "pong"];

    /// Convert a client-supplied `result` value into result blocks.
    pub fn result_blocks(result: &serde_json::Value) -> Vec<ResultBlock> {
        match result {
            serde_json::Value::String(s) => vec![ResultBlock::text(s.clone())],
            other => vec![ResultBlock::Json {
                value: other.clone(),
            }],
        }
    }
}

impl EventKind for InboundEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::Chat { .. } => "chat",
            InboundEvent::Control { .. } => "control",
            InboundEvent::ToolResult { .. } => "tool_result",
            InboundEvent::Ping => "ping",
            InboundEvent::Pong => "pong",
        }
    }
}

/// Why a turn's event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Complete,
    Cancelled,
    Error,
}

/// Core → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// A chunk of model-generated text.
    Content {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    ToolUse {
        tool_name: String,
        tool_id: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_id: String,
        output: Vec<ResultBlock>,
        status: ToolStatus,
    },
    Progress {
        tool_id: String,
        data: serde_json::Value,
    },
    /// The model call is being retried after a recoverable failure.
    Retry {
        attempt: u32,
        max_attempts: u32,
        reason: String,
        delay_ms: u64,
    },
    /// The turn is suspended until the client answers these tool invocations.
    AwaitingInput {
        requests: Vec<ToolInvocationRequest>,
    },
    Error {
        code: ErrorCode,
        number: u16,
        message: String,
        recoverable: bool,
    },
    End {
        reason: EndReason,
    },
    Ping,
    Pong,
    SessionOpened {
        session_id: String,
        resumed: bool,
        message_count: usize,
    },
    ServerShutdown {
        grace_ms: u64,
    },
}

impl OutboundEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        OutboundEvent::Error {
            code,
            number: code.as_u16(),
            message: message.into(),
            recoverable,
        }
    }
}

impl EventKind for OutboundEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OutboundEvent::Content { .. } => "content",
            OutboundEvent::ToolUse { .. } => "tool_use",
            OutboundEvent::ToolResult { .. } => "tool_result",
            OutboundEvent::Progress { .. } => "progress",
            OutboundEvent::Retry { .. } => "retry",
            OutboundEvent::AwaitingInput { .. } => "awaiting_input",
            OutboundEvent::Error { .. } => "error",
            OutboundEvent::End { .. } => "end",
            OutboundEvent::Ping => "ping",
            OutboundEvent::Pong => "pong",
            OutboundEvent::SessionOpened { .. } => "session_opened",
            OutboundEvent::ServerShutdown { .. } => "server_shutdown",
        }
    }
}
