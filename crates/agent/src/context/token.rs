//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. This is within
//! ~10% for BPE tokenizers on English text, which is enough to decide when a
//! history needs reducing.

use agentwire_core::history::History;
use agentwire_core::message::Message;
use agentwire_core::tool::ToolDefinition;

/// Per-message overhead for role name, delimiters and formatting markers.
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    MESSAGE_OVERHEAD + message.char_len().div_ceil(4)
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

pub fn estimate_history_tokens(history: &History) -> usize {
    estimate_messages_tokens(history.messages())
}

/// Estimate tokens for a tool definition (serialized as JSON).
pub fn estimate_tool_tokens(tool: &ToolDefinition) -> usize {
    let json = serde_json::to_string(tool).unwrap_or_default();
    estimate_tokens(&json)
}
