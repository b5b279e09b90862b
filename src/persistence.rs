//! Conversation persistence collaborator.
//!
//! The relay only needs two things from it: placeholder ids before a job is
//! stored, and a place to put each finished answer. Querying history is out
//! of scope; callers send prior turns with the job.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::CallerId;
use crate::jobs::JobRequest;
use crate::llm::Provider;
use crate::normalized::Usage;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("conversation '{0}' does not exist")]
    ConversationNotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Ids materialized before any token is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    pub conversation_id: String,
    pub prompt_id: String,
    /// `true` when the conversation did not exist before this request.
    pub created_conversation: bool,
}

/// One target's successful answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMessage {
    pub conversation_id: String,
    pub prompt_id: String,
    pub target_id: String,
    pub provider: Provider,
    pub model_id: String,
    pub content: String,
    pub usage: Option<Usage>,
    pub latency_ms: Option<u64>,
}

#[async_trait::async_trait]
pub trait PersistenceLayer: Send + Sync + std::fmt::Debug {
    /// Create (or reuse) the conversation and record the user prompt.
    async fn create_conversation_placeholder(
        &self,
        caller: &CallerId,
        request: &JobRequest,
    ) -> Result<Placeholders, PersistenceError>;

    /// Store a finished answer.
    async fn append_final_message(&self, message: FinalMessage) -> Result<(), PersistenceError>;
}

/// A stored prompt or answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConversationEntry {
    Prompt {
        prompt_id: String,
        text: String,
        created_at: DateTime<Utc>,
    },
    Answer {
        message: FinalMessage,
        created_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub owner: CallerId,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ConversationEntry>,
}

/// Keeps conversations in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    inner: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one conversation.
    #[must_use]
    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[async_trait::async_trait]
impl PersistenceLayer for InMemoryPersistence {
    async fn create_conversation_placeholder(
        &self,
        caller: &CallerId,
        request: &JobRequest,
    ) -> Result<Placeholders, PersistenceError> {
        let now = Utc::now();
        let prompt_id = Uuid::new_v4().to_string();
        let mut conversations = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let (conversation_id, created_conversation) = match &request.conversation_id {
            Some(id) => match conversations.get(id) {
                Some(c) if &c.owner == caller => (id.clone(), false),
                _ => return Err(PersistenceError::ConversationNotFound(id.clone())),
            },
            None => {
                let id = Uuid::new_v4().to_string();
                conversations.insert(
                    id.clone(),
                    Conversation {
                        id: id.clone(),
                        owner: caller.clone(),
                        created_at: now,
                        entries: Vec::new(),
                    },
                );
                (id, true)
            }
        };

        if let Some(conversation) = conversations.get_mut(&conversation_id) {
            conversation.entries.push(ConversationEntry::Prompt {
                prompt_id: prompt_id.clone(),
                text: request.prompt.clone(),
                created_at: now,
            });
        }

        Ok(Placeholders {
            conversation_id,
            prompt_id,
            created_conversation,
        })
    }

    async fn append_final_message(&self, message: FinalMessage) -> Result<(), PersistenceError> {
        let mut conversations = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let conversation = conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| PersistenceError::ConversationNotFound(message.conversation_id.clone()))?;

        conversation.entries.push(ConversationEntry::Answer {
            message,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fixtures::{request, selection};

    fn final_message(conversation_id: &str) -> FinalMessage {
        FinalMessage {
            conversation_id: conversation_id.to_string(),
            prompt_id: "p".into(),
            target_id: "gpt-4o".into(),
            provider: Provider::OpenAI,
            model_id: "gpt-4o".into(),
            content: "Hello".into(),
            usage: Some(Usage::new(1, 1)),
            latency_ms: Some(10),
        }
    }

    #[tokio::test]
    async fn test_placeholder_creates_conversation() {
        let store = InMemoryPersistence::new();
        let caller = CallerId::new("u1");
        let req = request(vec![selection(Provider::OpenAI, "gpt-4o")]);

        let ids = store.create_conversation_placeholder(&caller, &req).await.unwrap();
        assert!(ids.created_conversation);

        let conversation = store.conversation(&ids.conversation_id).unwrap();
        assert_eq!(conversation.owner, caller);
        assert!(matches!(
            &conversation.entries[0],
            ConversationEntry::Prompt { text, .. } if text == "Say hello"
        ));
    }

    #[tokio::test]
    async fn test_existing_conversation_is_reused_by_owner_only() {
        let store = InMemoryPersistence::new();
        let owner = CallerId::new("u1");
        let mut req = request(vec![selection(Provider::OpenAI, "gpt-4o")]);
        let first = store.create_conversation_placeholder(&owner, &req).await.unwrap();

        req.conversation_id = Some(first.conversation_id.clone());
        let second = store.create_conversation_placeholder(&owner, &req).await.unwrap();
        assert!(!second.created_conversation);
        assert_eq!(second.conversation_id, first.conversation_id);

        let other = CallerId::new("u2");
        assert!(matches!(
            store.create_conversation_placeholder(&other, &req).await,
            Err(PersistenceError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_final_message() {
        let store = InMemoryPersistence::new();
        let caller = CallerId::anonymous();
        let req = request(vec![selection(Provider::OpenAI, "gpt-4o")]);
        let ids = store.create_conversation_placeholder(&caller, &req).await.unwrap();

        store
            .append_final_message(final_message(&ids.conversation_id))
            .await
            .unwrap();
        assert_eq!(store.conversation(&ids.conversation_id).unwrap().entries.len(), 2);

        assert!(store.append_final_message(final_message("missing")).await.is_err());
    }
}
