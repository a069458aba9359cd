//! Active-conversation selection for interactive callers.
//!
//! Switching is pure selection: it checks that the conversation exists and
//! records it as active. History is never loaded eagerly; the engine reads
//! it from the store when the next question arrives.

use std::sync::Arc;

use qa_harness_core::models::{Conversation, ConversationSummary};
use qa_harness_core::store::ConversationStore;
use qa_harness_core::QaError;

pub struct ChatSession {
    store: Arc<dyn ConversationStore>,
    active: Option<String>,
}

impl ChatSession {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            active: None,
        }
    }

    /// Create a conversation and make it active.
    pub async fn new_conversation(&mut self, title: Option<String>) -> Result<Conversation, QaError> {
        let conversation = self.store.create_conversation(title).await?;
        self.active = Some(conversation.id.clone());
        Ok(conversation)
    }

    /// Make an existing conversation active. Unknown ids leave the current
    /// selection untouched.
    pub async fn switch(&mut self, conversation_id: &str) -> Result<(), QaError> {
        if !self.store.contains(conversation_id).await {
            return Err(QaError::ConversationNotFound(conversation_id.to_string()));
        }
        self.active = Some(conversation_id.to_string());
        Ok(())
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// The active conversation, creating one if none is selected yet.
    pub async fn ensure_active(&mut self) -> Result<String, QaError> {
        match &self.active {
            Some(id) => Ok(id.clone()),
            None => Ok(self.new_conversation(None).await?.id),
        }
    }

    pub async fn list(&self) -> Result<Vec<ConversationSummary>, QaError> {
        self.store.list_conversations().await
    }

    /// Retitle the active conversation.
    pub async fn rename_active(&self, title: &str) -> Result<ConversationSummary, QaError> {
        let Some(id) = self.active.as_deref() else {
            return Err(QaError::InvalidParameter("no active conversation".into()));
        };
        self.store.rename_conversation(id, title).await
    }

    /// Drop the selection if it points at a conversation deleted elsewhere.
    pub fn forget(&mut self, conversation_id: &str) {
        if self.active.as_deref() == Some(conversation_id) {
            self.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_harness_core::store::memory::InMemoryConversationStore;

    fn session() -> ChatSession {
        ChatSession::new(Arc::new(InMemoryConversationStore::new()))
    }

    #[tokio::test]
    async fn test_new_conversation_becomes_active() {
        let mut session = session();
        assert!(session.active().is_none());
        let conv = session.new_conversation(None).await.unwrap();
        assert_eq!(session.active(), Some(conv.id.as_str()));
        assert_eq!(conv.title, "Conversation 1");
    }

    #[tokio::test]
    async fn test_switch_to_unknown_keeps_selection() {
        let mut session = session();
        let conv = session.new_conversation(Some("ethics".into())).await.unwrap();
        let err = session.switch("nope").await.unwrap_err();
        assert!(matches!(err, QaError::ConversationNotFound(_)));
        assert_eq!(session.active(), Some(conv.id.as_str()));
    }

    #[tokio::test]
    async fn test_switch_between_conversations() {
        let mut session = session();
        let first = session.new_conversation(None).await.unwrap();
        let second = session.new_conversation(None).await.unwrap();
        assert_eq!(session.active(), Some(second.id.as_str()));
        session.switch(&first.id).await.unwrap();
        assert_eq!(session.active(), Some(first.id.as_str()));
        assert_eq!(session.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_active() {
        let mut session = session();
        let err = session.rename_active("early").await.unwrap_err();
        assert!(matches!(err, QaError::InvalidParameter(_)));

        session.new_conversation(None).await.unwrap();
        let summary = session.rename_active("Ethics").await.unwrap();
        assert_eq!(summary.title, "Ethics");
        assert_eq!(session.list().await.unwrap()[0].title, "Ethics");
    }

    #[tokio::test]
    async fn test_forget_clears_only_matching_selection() {
        let mut session = session();
        let first = session.new_conversation(None).await.unwrap();
        let second = session.new_conversation(None).await.unwrap();
        session.forget(&first.id);
        assert_eq!(session.active(), Some(second.id.as_str()));
        session.forget(&second.id);
        assert!(session.active().is_none());
    }

    #[tokio::test]
    async fn test_ensure_active_creates_once() {
        let mut session = session();
        let a = session.ensure_active().await.unwrap();
        let b = session.ensure_active().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(session.list().await.unwrap().len(), 1);
    }
}
