//! The no-op policy, for short-lived or externally managed conversations.

use async_trait::async_trait;

use agentwire_core::error::ModelError;
use agentwire_core::history::History;

use super::{ContextError, ContextManager};

#[derive(Debug, Default)]
pub struct NullContextManager {
    removed: u64,
}

impl NullContextManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextManager for NullContextManager {
    fn name(&self) -> &str {
        "null"
    }

    async fn apply_management(&mut self, _history: &mut History) {}

    async fn reduce_context(
        &mut self,
        history: &mut History,
        _cause: Option<&ModelError>,
    ) -> Result<(), ContextError> {
        Err(ContextError::CannotReduce {
            messages: history.len(),
        })
    }

    fn removed_message_count(&self) -> u64 {
        self.removed
    }

    fn restore_removed_count(&mut self, count: u64) {
        self.removed = count;
    }
}
