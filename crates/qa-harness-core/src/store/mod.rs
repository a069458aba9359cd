//! Conversation storage abstraction.
//!
//! The [`ConversationStore`] trait holds independent conversation logs and
//! is injected into the orchestrator, so tests can run against an isolated
//! [`InMemoryConversationStore`](memory::InMemoryConversationStore).
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create_conversation`](ConversationStore::create_conversation) | New empty log with a fresh id |
//! | [`append_message`](ConversationStore::append_message) | Append one message atomically |
//! | [`append_messages`](ConversationStore::append_messages) | Append a batch atomically |
//! | [`get_history`](ConversationStore::get_history) | Most recent window, oldest-first |
//! | [`list_conversations`](ConversationStore::list_conversations) | Summaries in creation order |
//! | [`get_conversation`](ConversationStore::get_conversation) | Full copy of one conversation |
//! | [`rename_conversation`](ConversationStore::rename_conversation) | Replace the title |
//! | [`delete_conversation`](ConversationStore::delete_conversation) | Remove a conversation and its log |
//! | [`snapshot`](ConversationStore::snapshot) | Hand-off to a session storage collaborator |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QaError;
use crate::models::{Conversation, ConversationSummary, Message};

/// Rough characters-per-token ratio used for token-budget windows.
pub const CHARS_PER_TOKEN: usize = 4;

/// Bound applied when reading history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    /// The `n` most recent messages.
    Messages(usize),
    /// As many recent messages as fit in `n` estimated tokens. The newest
    /// message is always kept.
    Tokens(usize),
}

/// Full store contents in creation order, JSON-serializable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub conversations: Vec<Conversation>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation. A missing title becomes
    /// `"Conversation N"`, N being its 1-based creation index.
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, QaError>;

    /// Append one message. Fails with [`QaError::ConversationNotFound`] for
    /// unknown ids.
    async fn append_message(&self, conversation_id: &str, message: Message) -> Result<(), QaError>;

    /// Append several messages as one unit: readers see all of them or none.
    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), QaError>;

    /// Most recent messages within `window`, oldest-first.
    async fn get_history(
        &self,
        conversation_id: &str,
        window: HistoryWindow,
    ) -> Result<Vec<Message>, QaError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, QaError>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, QaError>;

    /// Replace the title. Blank titles are rejected with
    /// [`QaError::InvalidParameter`]; messages are untouched.
    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<ConversationSummary, QaError>;

    /// Remove a conversation with all of its messages. Default titles of
    /// later conversations keep counting from the total ever created.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), QaError>;

    async fn contains(&self, conversation_id: &str) -> bool;

    async fn snapshot(&self) -> Result<StoreSnapshot, QaError>;
}

/// Estimated token cost of a message body.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Select the tail of `messages` allowed by `window`, keeping order.
pub fn window_messages(messages: &[Message], window: HistoryWindow) -> Vec<Message> {
    let start = match window {
        HistoryWindow::Messages(n) => messages.len().saturating_sub(n),
        HistoryWindow::Tokens(budget) => {
            let mut used = 0usize;
            let mut start = messages.len();
            for (i, message) in messages.iter().enumerate().rev() {
                let cost = estimate_tokens(&message.content);
                if start < messages.len() && used + cost > budget {
                    break;
                }
                used += cost;
                start = i;
            }
            start
        }
    };
    messages[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(contents: &[&str]) -> Vec<Message> {
        contents.iter().map(|c| Message::user(*c)).collect()
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_message_window_keeps_newest() {
        let all = msgs(&["a", "b", "c", "d"]);
        let window = window_messages(&all, HistoryWindow::Messages(2));
        assert_eq!(contents(&window), vec!["c", "d"]);
    }

    #[test]
    fn test_message_window_larger_than_log() {
        let all = msgs(&["a", "b"]);
        assert_eq!(window_messages(&all, HistoryWindow::Messages(10)).len(), 2);
        assert!(window_messages(&all, HistoryWindow::Messages(0)).is_empty());
    }

    #[test]
    fn test_token_window_drops_oldest_first() {
        // 8 chars = 2 tokens each
        let all = msgs(&["aaaaaaaa", "bbbbbbbb", "cccccccc"]);
        let window = window_messages(&all, HistoryWindow::Tokens(4));
        assert_eq!(contents(&window), vec!["bbbbbbbb", "cccccccc"]);
    }

    #[test]
    fn test_token_window_always_keeps_newest() {
        let all = msgs(&["short", &"x".repeat(400)]);
        let window = window_messages(&all, HistoryWindow::Tokens(10));
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content.len(), 400);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
