//! Summarizing policy: fold the oldest part of the history into one
//! model-written summary message.
//!
//! The folded span starts right after the system message and covers
//! `ceil(ratio * n)` of the `n` non-system messages, with the ratio clamped to
//! `[0.1, 0.8]`. The trailing `preserve_recent` messages are never folded. If
//! the span's end would split a tool pair it is extended to take the whole
//! pair; when that would reach into the preserved tail it shrinks to end
//! before the pair instead.
//!
//! When the summarizer fails, the policy falls back to dropping the oldest
//! messages like a sliding window. A bounded context matters more than a
//! good summary.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use agentwire_core::error::ModelError;
use agentwire_core::history::History;
use agentwire_core::message::{Message, Role};
use agentwire_core::model::{ModelClient, ModelRequest, collect_text};

use super::sliding_window::{drop_for_tokens, drop_oldest, overflow_margin, trim_to_window};
use super::token::{estimate_history_tokens, estimate_message_tokens, estimate_messages_tokens};
use super::{ContextError, ContextManager};

const SUMMARY_PROMPT: &str = "You compress conversations. Summarize the transcript below \
into a short paragraph that keeps every fact, decision, open question and tool outcome \
the conversation still depends on. Reply with the summary only.";

/// Rounds of summarization one `apply_management` call may run.
const MAX_ROUNDS: usize = 4;

pub struct SummarizingManager {
    summarizer: Arc<dyn ModelClient>,
    max_tokens: usize,
    summary_ratio: f64,
    preserve_recent: usize,
    /// Hard message bound applied when summarizing is impossible.
    window_size: Option<usize>,
    timeout: Duration,
    removed: u64,
}

impl SummarizingManager {
    pub fn new(summarizer: Arc<dyn ModelClient>, max_tokens: usize) -> Self {
        Self {
            summarizer,
            max_tokens,
            summary_ratio: 0.3,
            preserve_recent: 10,
            window_size: None,
            timeout: Duration::from_secs(60),
            removed: 0,
        }
    }

    pub fn with_summary_ratio(mut self, ratio: f64) -> Self {
        self.summary_ratio = ratio;
        self
    }

    pub fn with_preserve_recent(mut self, n: usize) -> Self {
        self.preserve_recent = n;
        self
    }

    pub fn with_window_size(mut self, window: usize) -> Self {
        self.window_size = Some(window.max(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The span `[start, end)` the next summary would fold, if any.
    fn summary_span(&self, history: &History) -> Option<(usize, usize)> {
        let start = history.reducible_start();
        let len = history.len();
        let total = len - start;
        let ratio = self.summary_ratio.clamp(0.1, 0.8);
        let budget = total.saturating_sub(self.preserve_recent);
        let count = ((ratio * total as f64 - 1e-9).ceil() as usize).min(budget);
        if count == 0 {
            return None;
        }

        let limit = start + budget;
        let mut end = start + count;
        if !history.is_clean_cut(end) {
            let extended = history.next_clean_cut(end);
            end = if extended <= limit {
                extended
            } else {
                history.prev_clean_cut(end, start)
            };
        }

        // A lone summary folded into a new summary gains nothing.
        let folds_only_summary = end == start + 1 && history.messages()[start].is_summary();
        (end > start && !folds_only_summary).then_some((start, end))
    }

    /// Fold one span into a summary. `Ok(false)` when there is nothing to fold.
    async fn summarize_once(&self, history: &mut History) -> Result<bool, ModelError> {
        let Some((start, end)) = self.summary_span(history) else {
            return Ok(false);
        };

        let span = &history.messages()[start..end];
        let span_tokens = estimate_messages_tokens(span);
        let request = ModelRequest {
            messages: vec![Message::system(SUMMARY_PROMPT), Message::user(transcript(span))],
            tools: vec![],
        };

        let summary = tokio::time::timeout(self.timeout, async {
            let stream = self.summarizer.invoke(request).await?;
            collect_text(stream).await
        })
        .await
        .map_err(|_| ModelError::Timeout("summarizer".into()))??;

        let summary = summary.trim();
        if summary.is_empty() {
            return Err(ModelError::Stream("summarizer returned no text".into()));
        }
        // The summary message pays the same per-message overhead as the span.
        let summary = Message::summary(summary);
        if estimate_message_tokens(&summary) >= span_tokens {
            return Err(ModelError::Stream(
                "summary is not shorter than what it replaces".into(),
            ));
        }

        let folded = end - start;
        history.replace_range(start..end, summary);
        info!(
            folded,
            span_tokens,
            remaining = history.len(),
            "Summarized conversation prefix"
        );
        Ok(true)
    }

    /// Drop messages the way a sliding window would.
    fn fallback_trim(&mut self, history: &mut History) -> usize {
        let mut removed = 0;
        let over = estimate_history_tokens(history).saturating_sub(self.max_tokens);
        if over > 0 {
            removed += drop_for_tokens(history, over);
        }
        if let Some(window) = self.window_size {
            removed += trim_to_window(history, window);
        }
        self.removed += removed as u64;
        removed
    }
}

/// Render messages as a plain transcript for the summarizer.
fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::System => "system",
                Role::User if m.is_summary() => "earlier summary",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut line = format!("{who}: {}", m.text());
            for block in &m.content {
                if let agentwire_core::message::ContentBlock::ToolUse { name, input, .. } = block {
                    line.push_str(&format!(" [called {name} with {input}]"));
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ContextManager for SummarizingManager {
    fn name(&self) -> &str {
        "summarizing"
    }

    async fn apply_management(&mut self, history: &mut History) {
        for _ in 0..MAX_ROUNDS {
            if estimate_history_tokens(history) <= self.max_tokens {
                break;
            }
            match self.summarize_once(history).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "Summarization failed, falling back to sliding window");
                    break;
                }
            }
        }
        // Whatever summarizing could not fix is trimmed.
        let removed = self.fallback_trim(history);
        if removed > 0 {
            debug!(removed, "Trimmed history after summarization");
        }
    }

    async fn reduce_context(
        &mut self,
        history: &mut History,
        cause: Option<&ModelError>,
    ) -> Result<(), ContextError> {
        match self.summarize_once(history).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Summarization failed, falling back to sliding window"),
        }

        let removed = match cause {
            Some(ModelError::ContextOverflow {
                excess_tokens: Some(excess),
                ..
            }) => drop_for_tokens(history, *excess + overflow_margin(*excess)),
            _ => drop_oldest(history, 2),
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
