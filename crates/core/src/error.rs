//! Error types for the agentwire domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant, and every error that can
//! reach a client maps onto a stable [`ErrorCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all agentwire operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model collaborator errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Wire protocol errors ---
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Persistence errors ---
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable client-facing code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Model(e) => e.code(),
            Error::Tool(_) => ErrorCode::ToolFailed,
            Error::Session(e) => e.code(),
            Error::Protocol(e) => e.code(),
            Error::Repository(_)
            | Error::Config { .. }
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Stable, grouped error codes surfaced to clients.
///
/// | range | group |
/// |-------|-------|
/// | 1xxx  | connection |
/// | 2xxx  | auth |
/// | 3xxx  | protocol |
/// | 4xxx  | agent / tool |
/// | 5xxx  | server |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The connection closed while a turn was in flight.
    ConnectionClosed,
    /// The peer did not answer a heartbeat ping in time.
    HeartbeatTimeout,
    /// The connection could not be established in time.
    ConnectionTimeout,
    /// Reserved: authentication happens outside the core.
    Unauthorized,
    /// The inbound envelope could not be decoded.
    MalformedEnvelope,
    /// The inbound envelope exceeds the configured size.
    MessageTooLarge,
    /// A chat event had no content.
    EmptyChat,
    /// A chat arrived while another turn was in flight.
    Busy,
    /// A tool result arrived for an id nobody is waiting on.
    UnknownToolResult,
    /// The event type is not accepted in this direction or state.
    UnsupportedEvent,
    /// A tool invocation failed.
    ToolFailed,
    /// The model collaborator kept rate limiting after all retries.
    RateLimited,
    /// The context could not be reduced enough to fit the model.
    ContextExhausted,
    /// The model call exceeded its timeout.
    ModelTimeout,
    /// The model call failed for a non-retryable reason.
    ModelFailed,
    /// The turn hit the iteration ceiling.
    MaxIterations,
    /// The model circuit breaker is open.
    CircuitOpen,
    /// Unexpected failure inside the runtime.
    InternalError,
    /// The server is shutting down.
    ServerShutdown,
}

impl ErrorCode {
    /// Numeric value of this code.
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::ConnectionClosed => 1001,
            ErrorCode::HeartbeatTimeout => 1002,
            ErrorCode::ConnectionTimeout => 1003,
            ErrorCode::Unauthorized => 2001,
            ErrorCode::MalformedEnvelope => 3001,
            ErrorCode::MessageTooLarge => 3002,
            ErrorCode::EmptyChat => 3003,
            ErrorCode::Busy => 3004,
            ErrorCode::UnknownToolResult => 3005,
            ErrorCode::UnsupportedEvent => 3006,
            ErrorCode::ToolFailed => 4001,
            ErrorCode::RateLimited => 4002,
            ErrorCode::ContextExhausted => 4003,
            ErrorCode::ModelTimeout => 4004,
            ErrorCode::ModelFailed => 4005,
            ErrorCode::MaxIterations => 4006,
            ErrorCode::CircuitOpen => 4007,
            ErrorCode::InternalError => 5001,
            ErrorCode::ServerShutdown => 5002,
        }
    }

    /// The group this code belongs to (`"connection"`, `"protocol"`, ...).
    pub fn category(self) -> &'static str {
        match self.as_u16() / 1000 {
            1 => "connection",
            2 => "auth",
            3 => "protocol",
            4 => "agent",
            _ => "server",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{name}")
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Rate limited by model provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Context window exceeded: {message}")]
    ContextOverflow {
        message: String,
        /// How many tokens over the limit the request was, when the
        /// provider reports it.
        excess_tokens: Option<usize>,
    },

    #[error("Model call timed out: {0}")]
    Timeout(String),

    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),
}

impl ModelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ModelError::RateLimited { .. } => ErrorCode::RateLimited,
            ModelError::ContextOverflow { .. } => ErrorCode::ContextExhausted,
            ModelError::Timeout(_) => ErrorCode::ModelTimeout,
            ModelError::Api { .. } | ModelError::Stream(_) => ErrorCode::ModelFailed,
            ModelError::CircuitOpen(_) => ErrorCode::CircuitOpen,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool panicked: {0}")]
    Panicked(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool call cancelled before it started: {0}")]
    Cancelled(String),
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("A turn is already in flight")]
    Busy,

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session {0} is already attached to a live connection")]
    AlreadyAttached(String),

    #[error("Heartbeat timed out after {0}ms")]
    HeartbeatTimeout(u64),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Closed | SessionError::Transport(_) => ErrorCode::ConnectionClosed,
            SessionError::Busy | SessionError::AlreadyAttached(_) => ErrorCode::Busy,
            SessionError::InvalidTransition { .. } => ErrorCode::InternalError,
            SessionError::HeartbeatTimeout(_) => ErrorCode::HeartbeatTimeout,
            SessionError::ShuttingDown => ErrorCode::ServerShutdown,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Chat content is empty")]
    EmptyContent,

    #[error("Unsupported event: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Malformed(_) => ErrorCode::MalformedEnvelope,
            ProtocolError::TooLarge { .. } => ErrorCode::MessageTooLarge,
            ProtocolError::EmptyContent => ErrorCode::EmptyChat,
            ProtocolError::Unsupported(_) => ErrorCode::UnsupportedEvent,
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
