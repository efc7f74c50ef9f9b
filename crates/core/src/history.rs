//! Conversation history: the ordered message store owned by one session.
//!
//! Insertion order is chronological. An optional system message sits at
//! index 0. Reductions go through the methods here so callers can keep the
//! tool-use / tool-result pairing intact.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

use crate::message::{Message, Role};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// A history that starts with the given system prompt.
    pub fn with_system(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(prompt)],
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn has_leading_system(&self) -> bool {
        self.messages
            .first()
            .is_some_and(|m| m.role == Role::System)
    }

    /// Index of the first message that reductions may touch.
    pub fn reducible_start(&self) -> usize {
        usize::from(self.has_leading_system())
    }

    /// Remove a contiguous range, returning the removed messages.
    pub fn remove_range(&mut self, range: Range<usize>) -> Vec<Message> {
        self.messages.drain(range).collect()
    }

    /// Replace a contiguous range with a single message.
    pub fn replace_range(&mut self, range: Range<usize>, replacement: Message) -> Vec<Message> {
        self.messages
            .splice(range, std::iter::once(replacement))
            .collect()
    }

    /// Whether cutting the history at `at` (everything before `at` removed or
    /// folded) would leave a tool result whose tool use is on the other side.
    pub fn is_clean_cut(&self, at: usize) -> bool {
        let at = at.min(self.messages.len());
        let before: HashSet<&str> = self.messages[..at]
            .iter()
            .flat_map(|m| m.tool_use_ids())
            .collect();
        !self.messages[at..].iter().any(|m| {
            m.is_tool_result()
                && m.tool_call_id
                    .as_deref()
                    .is_some_and(|id| before.contains(id))
        })
    }

    /// Smallest clean cut at or after `at`.
    pub fn next_clean_cut(&self, at: usize) -> usize {
        (at..=self.messages.len())
            .find(|&i| self.is_clean_cut(i))
            .unwrap_or(self.messages.len())
    }

    /// Largest clean cut at or before `at`, not below `floor`.
    pub fn prev_clean_cut(&self, at: usize, floor: usize) -> usize {
        (floor..=at.min(self.messages.len()))
            .rev()
            .find(|&i| self.is_clean_cut(i))
            .unwrap_or(floor)
    }

    /// Drop orphaned messages at the front of the reducible region: tool
    /// results whose tool use is gone, and tool uses missing any of their
    /// results. Returns how many messages were removed.
    pub fn drop_leading_orphans(&mut self) -> usize {
        let start = self.reducible_start();
        let mut removed = 0;
        while let Some(msg) = self.messages.get(start) {
            let orphan = if msg.is_tool_result() {
                true
            } else if msg.has_tool_use() {
                let answered: HashSet<&str> = self.messages[start + 1..]
                    .iter()
                    .filter(|m| m.is_tool_result())
                    .filter_map(|m| m.tool_call_id.as_deref())
                    .collect();
                !msg.tool_use_ids().iter().all(|id| answered.contains(id))
            } else {
                false
            };
            if !orphan {
                break;
            }
            self.messages.remove(start);
            removed += 1;
        }
        removed
    }

    /// Tool call ids that are unpaired: a tool use without its result, or a
    /// result without its tool use.
    pub fn dangling_tool_ids(&self) -> Vec<String> {
        let uses: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(|m| m.tool_use_ids())
            .collect();
        let results: HashSet<&str> = self
            .messages
            .iter()
            .filter(|m| m.is_tool_result())
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let mut dangling: Vec<String> = uses
            .symmetric_difference(&results)
            .map(|s| s.to_string())
            .collect();
        dangling.sort();
        dangling
    }

    pub fn is_well_paired(&self) -> bool {
        self.dangling_tool_ids().is_empty()
    }
}
