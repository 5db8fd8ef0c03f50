// ============================================
// CHORUS - Persistence
// ============================================

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::llm::{Message, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Unix seconds
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    /// Which provider produced an assistant message
    pub provider: Option<String>,
    pub created_at: i64,
}

impl StoredMessage {
    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub provider: Option<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            provider: None,
        }
    }

    pub fn assistant(provider: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            provider: Some(provider.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    pub source: Option<String>,
    pub chunk_count: usize,
    pub created_at: i64,
}

/// Conversation persistence as the chat flow needs it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<Conversation>;

    /// Newest first
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Messages in the order they were appended
    async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>>;

    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<StoredMessage>;

    async fn delete_conversation(&self, id: &str) -> Result<bool>;
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
