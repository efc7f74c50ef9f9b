//! The agent side of a session: context policies and the turn loop.
//!
//! A turn follows a **call → act → observe** cycle:
//!
//! 1. **Append** the user message to the session history
//! 2. **Call** the model with the history and tool definitions, streaming text
//! 3. **If tool calls**: dispatch them, append the results, go back to 2
//! 4. **If text only**: the turn is complete
//!
//! Client-side tools suspend the turn until the peer sends their results.
//! Context managers keep the history within the model's budget.

pub mod context;
pub mod loop_runner;
pub mod resilience;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{
    ContextError, ContextManager, NullContextManager, SlidingWindowManager, SummarizingManager,
    build_context_manager,
};
pub use agentwire_core::control::{Cancelled, TurnControl};
pub use loop_runner::{PendingInput, TurnContext, TurnLoop, TurnOutcome};
pub use resilience::{BreakerState, CircuitBreaker, RateLimiter, RetryPolicy};
pub use stream_event::{TurnEvent, TurnSink};
