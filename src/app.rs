// ============================================
// CHORUS - Application Wiring
// ============================================

//! Builds the runtime from `Settings` and runs the user-facing flows:
//! asking, ingesting, searching and inspecting state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheBackendKind, EmbeddingKind, Settings};
use crate::core::{BreakerSnapshot, CircuitRegistry, DispatchRequest, Metrics, ModelResponse, Orchestrator, StreamEvent};
use crate::embeddings::{EmbeddingProvider, HashEmbeddings, OpenAIEmbeddings, ScoredChunk};
use crate::error::DispatchError;
use crate::llm::history::reducer_by_name;
use crate::llm::{
    build_table, compact_history, conversation_title, CacheStats, LongestResponse, ProviderInfo, ProviderTable,
    ResponseCache, ResponseReducer,
};
use crate::rag::{Retriever, RetrieverConfig};
use crate::storage::{Conversation, ConversationStore, DocumentRecord, NewMessage, SqliteStore, StoredMessage};

/// Per-question options from the command line or REPL.
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Provider ids; empty means every healthy provider
    pub providers: Vec<String>,
    /// Prepend knowledge-base context
    pub rag: bool,
    pub top_k: Option<usize>,
    /// Continue this conversation instead of starting a new one
    pub conversation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub conversation: Conversation,
    pub context: Option<String>,
    pub responses: Vec<ModelResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    #[serde(flatten)]
    pub info: ProviderInfo,
    pub breaker: BreakerSnapshot,
}

pub struct App {
    settings: Settings,
    orchestrator: Orchestrator,
    store: Arc<SqliteStore>,
    retriever: Retriever,
    reducer: Box<dyn ResponseReducer>,
}

impl App {
    /// Wire everything from configuration: provider clients, breakers,
    /// cache, database and retriever.
    pub fn new(settings: Settings) -> Result<Self> {
        let database = settings.database_path()?;
        let store = Arc::new(
            SqliteStore::open(&database)
                .with_context(|| format!("Failed to open database {}", database.display()))?,
        );
        let providers = build_table(&settings);
        if providers.is_empty() {
            tracing::warn!("no providers available, set an API key for at least one of them");
        }
        let embedder = embedder_from(&settings);

        Ok(Self::with_components(settings, providers, store, embedder))
    }

    /// Assemble from explicit parts
    pub fn with_components(
        settings: Settings,
        providers: ProviderTable,
        store: Arc<SqliteStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let cache = if !settings.cache.enabled {
            ResponseCache::disabled()
        } else {
            match settings.cache.backend {
                CacheBackendKind::Memory => {
                    ResponseCache::in_memory(settings.cache.max_entries, settings.cache_ttl())
                }
                CacheBackendKind::Sqlite => ResponseCache::new(store.clone(), settings.cache_ttl()),
            }
        };

        let orchestrator = Orchestrator::new(
            Arc::new(providers),
            Arc::new(CircuitRegistry::new(settings.breaker_config())),
            Arc::new(cache),
        )
        .with_prompts(settings.prompt_templates())
        .with_metrics(Arc::new(Metrics::new()))
        .with_stream_timeout(settings.stream_timeout());

        let retriever = Retriever::new(
            embedder,
            store.clone(),
            RetrieverConfig {
                chunking: settings.chunk_config(),
                top_k: settings.rag.top_k,
                min_score: settings.rag.min_score,
                max_context_chars: settings.rag.max_context_chars,
            },
        );

        let reducer = reducer_by_name(&settings.history.reducer).unwrap_or_else(|| {
            tracing::warn!(reducer = %settings.history.reducer, "unknown history reducer, using longest");
            Box::new(LongestResponse)
        });

        Self {
            settings,
            orchestrator,
            store,
            retriever,
            reducer,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &Metrics {
        self.orchestrator.metrics()
    }

    /// Ask every selected provider, then record the exchange.
    ///
    /// With a `sink`, responses are streamed as events. Only successful
    /// replies are stored, each tagged with the provider that wrote it.
    pub async fn ask(
        &self,
        prompt: &str,
        options: &AskOptions,
        sink: Option<mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<AskOutcome> {
        let existing = match options.conversation.as_deref() {
            Some(id) => Some(
                self.store
                    .get_conversation(id)
                    .await?
                    .with_context(|| format!("Conversation not found: {}", id))?,
            ),
            None => None,
        };

        let history = match &existing {
            Some(conversation) => {
                let stored = self.store.messages(&conversation.id).await?;
                let messages: Vec<_> = stored.iter().map(StoredMessage::to_message).collect();
                compact_history(&messages, self.reducer.as_ref(), self.settings.history.max_messages)
            }
            None => Vec::new(),
        };

        let context = if options.rag {
            let top_k = options.top_k.unwrap_or(self.settings.rag.top_k);
            let results = self.retriever.retrieve(prompt, top_k).await;
            tracing::debug!(hits = results.len(), "retrieved context");
            (!results.is_empty()).then(|| self.retriever.build_context(&results))
        } else {
            None
        };

        let mut request = DispatchRequest::new(prompt)
            .with_history(history)
            .with_context(context.clone());
        if !options.providers.is_empty() {
            request = request.with_providers(options.providers.iter().cloned());
        }

        let responses = match sink {
            Some(sink) => self.orchestrator.dispatch_stream(&request, sink, cancel).await?,
            None => self.orchestrator.dispatch(&request, cancel).await?,
        };

        let conversation = match existing {
            Some(conversation) => conversation,
            None => {
                self.store
                    .create_conversation(&conversation_title(prompt))
                    .await?
            }
        };

        self.store
            .append_message(&conversation.id, NewMessage::user(prompt.trim()))
            .await?;
        for response in responses.iter().filter(|r| r.is_success()) {
            self.store
                .append_message(
                    &conversation.id,
                    NewMessage::assistant(&response.provider, &response.content),
                )
                .await?;
        }

        Ok(AskOutcome {
            conversation,
            context,
            responses,
        })
    }

    /// Add a UTF-8 text file to the knowledge base.
    pub async fn ingest<F>(&self, path: &Path, title: Option<&str>, progress: F) -> Result<DocumentRecord>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let title = match title {
            Some(title) => title.to_string(),
            None => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        };

        self.ingest_text(&title, Some(&path.display().to_string()), &text, progress)
            .await
    }

    pub async fn ingest_text<F>(
        &self,
        title: &str,
        source: Option<&str>,
        text: &str,
        progress: F,
    ) -> Result<DocumentRecord>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        if text.trim().is_empty() {
            anyhow::bail!("Document '{}' is empty", title);
        }

        let mut record = self.store.create_document(title, source)?;
        match self
            .retriever
            .ingest_with_progress(&record.id, text, progress)
            .await
        {
            Ok(chunks) => {
                record.chunk_count = chunks.len();
                Ok(record)
            }
            Err(e) => {
                self.store.delete_document(&record.id)?;
                Err(e)
            }
        }
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        Ok(self.retriever.try_retrieve(query, top_k).await?)
    }

    pub fn documents(&self) -> Result<Vec<DocumentRecord>> {
        self.store.list_documents()
    }

    /// Delete a document by id or title; `None` when nothing matched
    pub fn forget(&self, id_or_title: &str) -> Result<Option<DocumentRecord>> {
        let Some(document) = self.store.find_document(id_or_title)? else {
            return Ok(None);
        };
        self.store.delete_document(&document.id)?;
        tracing::info!(document = %document.id, "document removed");
        Ok(Some(document))
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.store.list_conversations().await
    }

    pub async fn history(&self, conversation_id: &str) -> Result<(Conversation, Vec<StoredMessage>)> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .with_context(|| format!("Conversation not found: {}", conversation_id))?;
        let messages = self.store.messages(conversation_id).await?;
        Ok((conversation, messages))
    }

    /// Delete a conversation with its messages; false when it did not exist
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let removed = self.store.delete_conversation(conversation_id).await?;
        if removed {
            tracing::info!(conversation = %conversation_id, "conversation removed");
        }
        Ok(removed)
    }

    /// Close one provider's breaker, or all of them with `None`.
    pub fn reset_breakers(&self, provider_id: Option<&str>) -> Result<()> {
        let breakers = self.orchestrator.breakers();
        match provider_id {
            Some(id) if !self.orchestrator.providers().contains(id) => {
                return Err(DispatchError::UnknownProvider(id.to_string()).into());
            }
            Some(id) => {
                breakers.reset(id);
            }
            None => breakers.reset_all(),
        }
        Ok(())
    }

    pub fn providers(&self) -> Vec<ProviderStatus> {
        let breakers = self.orchestrator.breakers();
        self.orchestrator
            .providers()
            .infos()
            .iter()
            .map(|info| ProviderStatus {
                info: info.clone(),
                breaker: breakers.get(&info.id).snapshot(),
            })
            .collect()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.orchestrator.cache().stats().await
    }

    pub async fn clear_cache(&self, pattern: Option<&str>) -> usize {
        self.orchestrator.cache().clear(pattern).await
    }
}

fn embedder_from(settings: &Settings) -> Arc<dyn EmbeddingProvider> {
    let config = &settings.embedding;
    match config.provider {
        EmbeddingKind::Hash => Arc::new(HashEmbeddings::new(config.dimension)),
        EmbeddingKind::OpenAi => match settings.embedding_api_key() {
            Some(key) => {
                let mut embedder = OpenAIEmbeddings::new(key).with_model(&config.model, config.dimension);
                if let Some(url) = &config.base_url {
                    embedder = embedder.with_base_url(url);
                }
                Arc::new(embedder)
            }
            None => {
                tracing::warn!("no embedding API key configured, using offline hash embeddings");
                Arc::new(HashEmbeddings::new(config.dimension))
            }
        },
    }
}
