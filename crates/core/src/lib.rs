//! # agentwire core
//!
//! Domain types, collaborator traits, and error definitions for the agentwire
//! streaming session runtime. This crate has **no transport dependencies**:
//! it defines the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here (model inference, tools,
//! session persistence). Implementations live elsewhere. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted mock collaborators
//! - Clean dependency graph (all crates depend inward on core)

pub mod control;
pub mod envelope;
pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod model;
pub mod repository;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use control::{Cancelled, TurnControl};
pub use envelope::{
    ControlAction, EndReason, Envelope, EventKind, InboundEvent, OutboundEvent,
};
pub use error::{Error, ErrorCode, ModelError, ProtocolError, Result, SessionError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use history::History;
pub use message::{ContentBlock, Message, ResultBlock, Role};
pub use model::{ModelClient, ModelEvent, ModelRequest, ModelStream, Usage};
pub use repository::{InMemorySessionRepository, SessionRepository, StoredSession};
pub use tool::{
    ProgressReporter, Tool, ToolDefinition, ToolInvocationRequest, ToolLocation, ToolProgress,
    ToolRegistry, ToolResult, ToolStatus,
};
