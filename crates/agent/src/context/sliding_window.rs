//! Sliding-window policy: keep the most recent messages, drop the rest.
//!
//! The window counts every message, the leading system message included,
//! but the system message itself is never dropped. After a trim, orphaned
//! messages at the new front (tool results whose tool use was dropped) are
//! removed too, so the window may end up shorter than its size.

use async_trait::async_trait;
use tracing::debug;

use agentwire_core::error::ModelError;
use agentwire_core::history::History;

use super::token::estimate_message_tokens;
use super::{ContextError, ContextManager};

/// Messages dropped on an overflow when the model gave no size hint.
const MIN_REACTIVE_DROP: usize = 2;

#[derive(Debug)]
pub struct SlidingWindowManager {
    window_size: usize,
    removed: u64,
}

impl SlidingWindowManager {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            removed: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

#[async_trait]
impl ContextManager for SlidingWindowManager {
    fn name(&self) -> &str {
        "sliding_window"
    }

    async fn apply_management(&mut self, history: &mut History) {
        let removed = trim_to_window(history, self.window_size);
        if removed > 0 {
            debug!(removed, remaining = history.len(), "Sliding window trimmed history");
            self.removed += removed as u64;
        }
    }

    async fn reduce_context(
        &mut self,
        history: &mut History,
        cause: Option<&ModelError>,
    ) -> Result<(), ContextError> {
        let excess = match cause {
            Some(ModelError::ContextOverflow {
                excess_tokens: Some(excess),
                ..
            }) => Some(*excess),
            _ => None,
        };

        let removed = match excess {
            Some(excess) => drop_for_tokens(history, excess + overflow_margin(excess)),
            None => {
                let over = history.len().saturating_sub(self.window_size);
                drop_oldest(history, over.max(MIN_REACTIVE_DROP))
            }
        };

        if removed == 0 {
            return Err(ContextError::CannotReduce {
                messages: history.len(),
            });
        }
        self.removed += removed as u64;
        Ok(())
    }

    fn removed_message_count(&self) -> u64 {
        self.removed
    }

    fn restore_removed_count(&mut self, count: u64) {
        self.removed = count;
    }
}

/// Extra tokens cleared beyond a reported overflow.
pub(crate) fn overflow_margin(excess: usize) -> usize {
    (excess / 10).max(16)
}

/// Drop the oldest messages until the history fits `window`, then clean up
/// orphans at the front. Returns how many messages were removed.
pub(crate) fn trim_to_window(history: &mut History, window: usize) -> usize {
    let mut removed = 0;
    if history.len() > window {
        let start = history.reducible_start();
        let cut = (start + history.len() - window).min(history.len());
        removed += history.remove_range(start..cut).len();
    }
    removed + history.drop_leading_orphans()
}

/// Drop up to `n` of the oldest reducible messages, always keeping the most
/// recent one, then clean up orphans at the front.
pub(crate) fn drop_oldest(history: &mut History, n: usize) -> usize {
    let start = history.reducible_start();
    let reducible = history.len() - start;
    let n = n.min(reducible.saturating_sub(1));
    if n == 0 {
        return 0;
    }
    let removed = history.remove_range(start..start + n).len();
    removed + history.drop_leading_orphans()
}

/// Drop the oldest reducible messages until at least `tokens` estimated
/// tokens are freed (or only the most recent message is left).
pub(crate) fn drop_for_tokens(history: &mut History, tokens: usize) -> usize {
    let start = history.reducible_start();
    let mut freed = 0;
    let mut n = 0;
    for message in &history.messages()[start..] {
        if freed >= tokens {
            break;
        }
        freed += estimate_message_tokens(message);
        n += 1;
    }
    drop_oldest(history, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwire_core::message::Message;
    use agentwire_core::tool::{ToolInvocationRequest, ToolResult};
    use serde_json::json;

    fn numbered(n: usize) -> History {
        let mut h = History::new();
        for i in 0..n {
            if i % 2 == 0 {
                h.push(Message::user(format!("m{i}")));
            } else {
                h.push(Message::assistant(format!("m{i}")));
            }
        }
        h
    }

    fn tool_use(ids: &[&str]) -> Message {
        let reqs: Vec<_> = ids
            .iter()
            .map(|id| ToolInvocationRequest::new(*id, "echo", json!({})))
            .collect();
        Message::tool_use("", &reqs)
    }

    fn tool_result(id: &str) -> Message {
        Message::tool_result(&ToolResult::success_text(id, "ok"))
    }

    #[tokio::test]
    async fn keeps_the_most_recent_window() {
        let mut h = numbered(25);
        let mut m = SlidingWindowManager::new(20);
        m.apply_management(&mut h).await;
        assert_eq!(h.len(), 20);
        assert_eq!(h.messages()[0].text(), "m5");
        assert_eq!(h.messages()[19].text(), "m24");
        assert_eq!(m.removed_message_count(), 5);
    }

    #[tokio::test]
    async fn split_pair_is_dropped_whole() {
        // Index 4 invokes a tool answered at index 5; a window of 20 over 25
        // messages cuts between them.
        let mut h = History::new();
        for i in 0..4 {
            h.push(Message::user(format!("m{i}")));
        }
        h.push(tool_use(&["call_x"]));
        h.push(tool_result("call_x"));
        for i in 6..25 {
            h.push(Message::user(format!("m{i}")));
        }
        assert_eq!(h.len(), 25);

        let mut m = SlidingWindowManager::new(20);
        m.apply_management(&mut h).await;
        assert_eq!(h.len(), 19);
        assert!(h.is_well_paired());
        assert_eq!(h.messages()[0].text(), "m6");
        assert_eq!(m.removed_message_count(), 6);
    }

    #[tokio::test]
    async fn system_message_survives_and_counts_toward_window() {
        let mut h = History::with_system("rules");
        for i in 0..10 {
            h.push(Message::user(format!("m{i}")));
        }
        let mut m = SlidingWindowManager::new(4);
        m.apply_management(&mut h).await;
        assert_eq!(h.len(), 4);
        assert!(h.has_leading_system());
        assert_eq!(h.messages()[1].text(), "m7");
    }

    #[tokio::test]
    async fn pairing_holds_for_every_window_size() {
        let mut base = History::with_system("sys");
        for turn in 0..6 {
            base.push(Message::user(format!("q{turn}")));
            let a = format!("a{turn}");
            let b = format!("b{turn}");
            base.push(tool_use(&[&a, &b]));
            base.push(tool_result(&a));
            base.push(tool_result(&b));
            base.push(Message::assistant(format!("r{turn}")));
        }

        for window in 1..=base.len() + 1 {
            let mut h = base.clone();
            let mut m = SlidingWindowManager::new(window);
            m.apply_management(&mut h).await;
            assert!(h.is_well_paired(), "window {window} left dangling ids");
            assert!(h.len() <= window.max(1), "window {window} kept {}", h.len());

            let mut h = base.clone();
            let mut m = SlidingWindowManager::new(window);
            let _ = m.reduce_context(&mut h, None).await;
            assert!(h.is_well_paired(), "reduce with window {window} left dangling ids");
        }
    }

    #[tokio::test]
    async fn reduce_clears_reported_overflow() {
        let mut h = History::new();
        for i in 0..10 {
            h.push(Message::user(format!("{i}").repeat(40))); // ~10-14 tokens each
        }
        let before = super::super::estimate_history_tokens(&h);
        let overflow = ModelError::ContextOverflow {
            message: "too long".into(),
            excess_tokens: Some(30),
        };

        let mut m = SlidingWindowManager::new(100);
        m.reduce_context(&mut h, Some(&overflow)).await.unwrap();
        let after = super::super::estimate_history_tokens(&h);
        assert!(before - after >= 30 + overflow_margin(30));
        assert!(m.removed_message_count() > 0);
    }

    #[tokio::test]
    async fn reduce_without_hint_drops_at_least_two() {
        let mut h = numbered(5);
        let mut m = SlidingWindowManager::new(40);
        m.reduce_context(&mut h, None).await.unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(m.removed_message_count(), 2);
    }

    #[tokio::test]
    async fn reduce_refuses_when_only_the_latest_message_is_left() {
        let mut h = History::with_system("sys");
        h.push(Message::user("only"));
        let mut m = SlidingWindowManager::new(40);
        assert!(matches!(
            m.reduce_context(&mut h, None).await,
            Err(ContextError::CannotReduce { messages: 2 })
        ));
        assert_eq!(h.len(), 2);
    }

    #[tokio::test]
    async fn removed_count_is_monotonic_and_restorable() {
        let mut m = SlidingWindowManager::new(3);
        m.restore_removed_count(10);
        let mut h = numbered(5);
        m.apply_management(&mut h).await;
        assert_eq!(m.removed_message_count(), 12);
        m.apply_management(&mut h).await;
        assert_eq!(m.removed_message_count(), 12);
    }
}
