//! In-memory [`ConversationStore`] scoped to a single session.
//!
//! Each conversation sits behind its own lock. The outer map lock is held
//! only long enough to look up or insert an entry, so appends to different
//! conversations never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::QaError;
use crate::models::{Conversation, ConversationSummary, Message};

use super::{window_messages, ConversationStore, HistoryWindow, StoreSnapshot};

#[derive(Default)]
struct Registry {
    /// Conversation ids in creation order.
    order: Vec<String>,
    /// Conversations ever created, deleted ones included.
    created: usize,
    conversations: HashMap<String, Arc<RwLock<Conversation>>>,
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    registry: RwLock<Registry>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a [`StoreSnapshot`], keeping its order.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut registry = Registry::default();
        for conversation in snapshot.conversations {
            let id = conversation.id.clone();
            if registry.conversations.contains_key(&id) {
                continue;
            }
            registry.order.push(id.clone());
            registry.created += 1;
            registry
                .conversations
                .insert(id, Arc::new(RwLock::new(conversation)));
        }
        Self {
            registry: RwLock::new(registry),
        }
    }

    fn entry(&self, conversation_id: &str) -> Result<Arc<RwLock<Conversation>>, QaError> {
        self.registry
            .read()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| QaError::ConversationNotFound(conversation_id.to_string()))
    }

    fn ordered_entries(&self) -> Vec<Arc<RwLock<Conversation>>> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter_map(|id| registry.conversations.get(id).cloned())
            .collect()
    }
}

/// Append keeping timestamps non-decreasing, so log order and time order
/// never disagree even if the wall clock steps back.
fn push_ordered(conversation: &mut Conversation, mut message: Message) {
    if let Some(last) = conversation.messages.last() {
        if message.created_at < last.created_at {
            message.created_at = last.created_at;
        }
    }
    conversation.messages.push(message);
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, QaError> {
        let mut registry = self.registry.write();
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("Conversation {}", registry.created + 1));

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title,
            created_at: Utc::now(),
            messages: Vec::new(),
        };

        registry.order.push(conversation.id.clone());
        registry.created += 1;
        registry.conversations.insert(
            conversation.id.clone(),
            Arc::new(RwLock::new(conversation.clone())),
        );
        Ok(conversation)
    }

    async fn append_message(&self, conversation_id: &str, message: Message) -> Result<(), QaError> {
        let entry = self.entry(conversation_id)?;
        push_ordered(&mut entry.write(), message);
        Ok(())
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), QaError> {
        let entry = self.entry(conversation_id)?;
        let mut conversation = entry.write();
        for message in messages {
            push_ordered(&mut conversation, message);
        }
        Ok(())
    }

    async fn get_history(
        &self,
        conversation_id: &str,
        window: HistoryWindow,
    ) -> Result<Vec<Message>, QaError> {
        let entry = self.entry(conversation_id)?;
        let conversation = entry.read();
        Ok(window_messages(&conversation.messages, window))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, QaError> {
        Ok(self
            .ordered_entries()
            .iter()
            .map(|entry| ConversationSummary::of(&entry.read()))
            .collect())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, QaError> {
        let entry = self.entry(conversation_id)?;
        let conversation = entry.read().clone();
        Ok(conversation)
    }

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<ConversationSummary, QaError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(QaError::InvalidParameter("title must not be empty".into()));
        }
        let entry = self.entry(conversation_id)?;
        let mut conversation = entry.write();
        conversation.title = title.to_string();
        Ok(ConversationSummary::of(&conversation))
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), QaError> {
        let mut registry = self.registry.write();
        if registry.conversations.remove(conversation_id).is_none() {
            return Err(QaError::ConversationNotFound(conversation_id.to_string()));
        }
        registry.order.retain(|id| id != conversation_id);
        Ok(())
    }

    async fn contains(&self, conversation_id: &str) -> bool {
        self.registry
            .read()
            .conversations
            .contains_key(conversation_id)
    }

    async fn snapshot(&self) -> Result<StoreSnapshot, QaError> {
        Ok(StoreSnapshot {
            conversations: self
                .ordered_entries()
                .iter()
                .map(|entry| entry.read().clone())
                .collect(),
        })
    }
}
