//! Domain event system: decoupled observation of sessions and turns.
//!
//! Events are published when something interesting happens in the runtime.
//! Observers (logging sinks, metrics exporters, tests) subscribe without the
//! session core knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A session was opened or re-attached
    SessionOpened {
        session_id: String,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },

    /// A session reached `Closed`
    SessionClosed {
        session_id: String,
        reason: String,
        turns: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn reached its terminal event
    TurnCompleted {
        session_id: String,
        turn_id: String,
        outcome: String, // "complete", "cancelled", "error", "awaiting_input"
        iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The context manager shrank a history
    ContextReduced {
        strategy: String,
        before: usize,
        after: usize,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
