//! Core data models for the question-answering pipeline.
//!
//! - [`Chunk`]: a span of the reference text with its precomputed embedding.
//! - [`RetrievalResult`]: a scored reference to a chunk, produced per query.
//! - [`Message`] / [`Conversation`]: the append-only conversation log.
//! - [`QueryContext`]: everything gathered for one request before prompting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous span of the reference text with its embedding.
///
/// Immutable once indexed; owned by the
/// [`SemanticIndex`](crate::index::SemanticIndex) and shared by `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier assigned at indexing time.
    pub id: String,
    /// Chunk text as it appears in the source.
    pub text: String,
    /// Precomputed embedding vector.
    pub embedding: Vec<f32>,
    /// Character offset of the chunk in the source text.
    pub source_offset: u64,
}

/// Citation handle for a chunk: enough to locate it, without the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub source_offset: u64,
}

impl From<&Chunk> for ChunkRef {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            source_offset: chunk.source_offset,
        }
    }
}

/// One scored hit from a nearest-neighbor lookup.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

impl RetrievalResult {
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef::from(self.chunk.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single entry in a conversation log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Chunks the message was grounded on (assistant messages only).
    #[serde(default)]
    pub context_refs: Vec<ChunkRef>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            context_refs: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, context_refs: Vec<ChunkRef>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            context_refs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// Lightweight listing entry for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    /// Timestamp of the latest message, or `created_at` when empty.
    pub last_activity: DateTime<Utc>,
    /// Leading characters of the latest message.
    pub preview: Option<String>,
}

/// Maximum number of characters kept in [`ConversationSummary::preview`].
pub const PREVIEW_CHARS: usize = 80;

impl ConversationSummary {
    pub fn of(conversation: &Conversation) -> Self {
        let last = conversation.messages.last();
        Self {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            created_at: conversation.created_at,
            message_count: conversation.messages.len(),
            last_activity: last.map(|m| m.created_at).unwrap_or(conversation.created_at),
            preview: last.map(|m| preview_text(&m.content)),
        }
    }
}

fn preview_text(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
    preview.push_str("...");
    preview
}

/// Per-request working set. Built fresh for each question, never persisted.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub question: String,
    pub history_window: Vec<Message>,
    pub retrieved: Vec<RetrievalResult>,
}

impl QueryContext {
    pub fn citations(&self) -> Vec<ChunkRef> {
        self.retrieved.iter().map(RetrievalResult::chunk_ref).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation_with(contents: &[&str]) -> Conversation {
        Conversation {
            id: "c1".into(),
            title: "Conversation 1".into(),
            created_at: Utc::now(),
            messages: contents.iter().map(|c| Message::user(*c)).collect(),
        }
    }

    #[test]
    fn test_summary_of_empty_conversation() {
        let conv = conversation_with(&[]);
        let summary = ConversationSummary::of(&conv);
        assert_eq!(summary.message_count, 0);
        assert_eq!(summary.last_activity, conv.created_at);
        assert!(summary.preview.is_none());
    }

    #[test]
    fn test_summary_preview_uses_latest_message() {
        let conv = conversation_with(&["first", "second"]);
        let summary = ConversationSummary::of(&conv);
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.preview.as_deref(), Some("second"));
    }

    #[test]
    fn test_summary_preview_truncates_on_char_boundary() {
        let long = "é".repeat(PREVIEW_CHARS + 10);
        let conv = conversation_with(&[&long]);
        let preview = ConversationSummary::of(&conv).preview.unwrap();
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
