use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a provider needs for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub history: Vec<Message>,
    /// System instructions, already merged with any retrieved context
    pub system: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            system: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    /// History followed by the prompt as the final user turn
    pub fn conversation(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        messages.push(Message::user(self.prompt.clone()));
        messages
    }
}

/// Ordered text deltas of one streamed completion.
pub type TextStream = BoxStream<'static, Result<String>>;

/// One remote AI completion service.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable provider id, e.g. "claude"
    fn id(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream the completion. Providers without native streaming get a
    /// one-shot stream carrying the full `complete` result.
    async fn stream(&self, request: &CompletionRequest) -> Result<TextStream> {
        let text = self.complete(request).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
    pub model: String,
    pub supports_streaming: bool,
}

/// Provider-id keyed table of clients, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderTable {
    order: Vec<ProviderInfo>,
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; a later registration with the same id replaces it
    pub fn register(&mut self, display_name: impl Into<String>, client: Arc<dyn ProviderClient>) {
        let info = ProviderInfo {
            id: client.id().to_string(),
            display_name: display_name.into(),
            model: client.model_name().to_string(),
            supports_streaming: client.supports_streaming(),
        };

        if self.clients.insert(info.id.clone(), client).is_some() {
            self.order.retain(|existing| existing.id != info.id);
        }
        self.order.push(info);
    }

    pub fn with(mut self, display_name: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.register(display_name, client);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Provider ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.order.iter().map(|info| info.id.clone()).collect()
    }

    pub fn infos(&self) -> &[ProviderInfo] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
