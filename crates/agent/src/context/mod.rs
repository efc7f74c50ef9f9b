//! Context window management.
//!
//! A [`ContextManager`] owns the policy that keeps a session's [`History`]
//! within budget. The turn loop calls [`ContextManager::apply_management`]
//! after a turn (and optionally after iterations), and
//! [`ContextManager::reduce_context`] when the model reports an overflow.
//!
//! Every policy keeps tool-use / tool-result pairs whole: a reduction either
//! removes both halves of a pair or neither.

pub mod null;
pub mod sliding_window;
pub mod summarizing;
pub mod token;

pub use null::NullContextManager;
pub use sliding_window::SlidingWindowManager;
pub use summarizing::SummarizingManager;
pub use token::{estimate_history_tokens, estimate_message_tokens, estimate_tokens};

use async_trait::async_trait;
use std::sync::Arc;

use agentwire_config::{ContextConfig, ContextStrategy};
use agentwire_core::error::ModelError;
use agentwire_core::history::History;
use agentwire_core::model::ModelClient;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Context cannot be reduced further ({messages} messages left)")]
    CannotReduce { messages: usize },
}

#[async_trait]
pub trait ContextManager: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &str;

    /// Bring the history back within budget. Runs after turns and, per the
    /// configured cadence, after loop iterations.
    async fn apply_management(&mut self, history: &mut History);

    /// Shrink the history after the model rejected it as too large.
    /// Succeeds only if the estimated token count strictly decreased.
    async fn reduce_context(
        &mut self,
        history: &mut History,
        cause: Option<&ModelError>,
    ) -> Result<(), ContextError>;

    /// Messages physically removed so far. Never decreases. Messages folded
    /// into a summary are not counted.
    fn removed_message_count(&self) -> u64;

    /// Seed the counter from persisted state on re-attach.
    fn restore_removed_count(&mut self, count: u64);
}

/// Build the manager selected by configuration. `summarizer` is only used by
/// the summarizing policy; without one it degrades to a sliding window.
pub fn build_context_manager(
    config: &ContextConfig,
    summarizer: Option<Arc<dyn ModelClient>>,
) -> Box<dyn ContextManager> {
    match (config.strategy, summarizer) {
        (ContextStrategy::Null, _) => Box::new(NullContextManager::new()),
        (ContextStrategy::Summarizing, Some(model)) => Box::new(
            SummarizingManager::new(model, config.max_tokens)
                .with_summary_ratio(config.summary_ratio)
                .with_preserve_recent(config.preserve_recent_messages)
                .with_window_size(config.window_size),
        ),
        (ContextStrategy::Summarizing, None) => {
            tracing::warn!("Summarizing context policy has no summarizer, using sliding window");
            Box::new(SlidingWindowManager::new(config.window_size))
        }
        (ContextStrategy::SlidingWindow, _) => {
            Box::new(SlidingWindowManager::new(config.window_size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedModel;

    #[test]
    fn config_selects_policy() {
        let mut config = ContextConfig::default();
        assert_eq!(build_context_manager(&config, None).name(), "sliding_window");

        config.strategy = ContextStrategy::Null;
        assert_eq!(build_context_manager(&config, None).name(), "null");

        config.strategy = ContextStrategy::Summarizing;
        assert_eq!(build_context_manager(&config, None).name(), "sliding_window");
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(vec![]));
        assert_eq!(
            build_context_manager(&config, Some(model)).name(),
            "summarizing"
        );
    }
}
