// ============================================
// CHORUS - Retriever
// ============================================

use std::sync::Arc;

use anyhow::{Context, Result};

use super::chunk::{chunk_text, ChunkConfig, DocumentChunk};
use crate::embeddings::{Embedding, EmbeddingProvider, ScoredChunk, VectorIndex};
use crate::error::RetrievalError;

const EMBED_BATCH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverConfig {
    pub chunking: ChunkConfig,
    /// Chunks returned when the caller does not ask for a count
    pub top_k: usize,
    /// Hits scoring below this are dropped
    pub min_score: Option<f32>,
    /// Upper bound on the rendered context block
    pub max_context_chars: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkConfig::default(),
            top_k: 3,
            min_score: None,
            max_context_chars: 8000,
        }
    }
}

/// Chunk + embed on the way in, embed + nearest-neighbor on the way out.
pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub async fn ingest(&self, document_id: &str, text: &str) -> Result<Vec<DocumentChunk>> {
        self.ingest_with_progress(document_id, text, |_, _| {}).await
    }

    /// Chunk, embed and index `text` in document order. `progress` receives
    /// (chunks indexed, total chunks). A failure part way through removes
    /// whatever was already indexed for the document.
    pub async fn ingest_with_progress<F>(
        &self,
        document_id: &str,
        text: &str,
        progress: F,
    ) -> Result<Vec<DocumentChunk>>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let chunks = chunk_text(document_id, text, &self.config.chunking);
        tracing::debug!(document = document_id, chunks = chunks.len(), "chunked document");

        if let Err(e) = self.index_chunks(&chunks, &progress).await {
            if let Err(cleanup) = self.index.remove_document(document_id).await {
                tracing::warn!(document = document_id, error = %cleanup, "failed to roll back partial ingestion");
            }
            return Err(e);
        }

        tracing::info!(document = document_id, chunks = chunks.len(), "document ingested");
        Ok(chunks)
    }

    async fn index_chunks<F>(&self, chunks: &[DocumentChunk], progress: &F) -> Result<()>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let model = self.embedder.model_name().to_string();
        let mut done = 0;

        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .context("Failed to embed document chunks")?;

            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "embedding provider returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                self.index
                    .insert(chunk, &Embedding::new(vector, model.clone()))
                    .await
                    .with_context(|| format!("Failed to index chunk {}", chunk.chunk_index))?;
                done += 1;
                progress(done, chunks.len());
            }
        }

        Ok(())
    }

    /// Ranked chunks for `query`. Any embedding or index failure yields an
    /// empty result.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Vec<ScoredChunk> {
        match self.try_retrieve(query, top_k).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, continuing without context");
                Vec::new()
            }
        }
    }

    pub async fn try_retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(RetrievalError::Embedding)?;
        if vector.is_empty() {
            return Err(RetrievalError::EmptyEmbedding);
        }

        let query = Embedding::new(vector, self.embedder.model_name());
        let mut results = self
            .index
            .nearest(&query, top_k)
            .await
            .map_err(RetrievalError::Index)?;

        if let Some(min_score) = self.config.min_score {
            results.retain(|r| r.score >= min_score);
        }
        Ok(results)
    }

    /// Render hits as a labelled context block, cut at `max_context_chars`.
    pub fn build_context(&self, results: &[ScoredChunk]) -> String {
        let max_chars = self.config.max_context_chars;
        let mut context = String::new();
        let mut total_chars = 0;

        for (i, result) in results.iter().enumerate() {
            let header = format!(
                "[Document {}] {}#{} (Relevance: {:.2})\n",
                i + 1,
                result.chunk.document_id,
                result.chunk.chunk_index,
                result.score
            );
            let entry = format!("{}{}\n\n", header, result.chunk.text);
            let entry_chars = entry.chars().count();

            if total_chars + entry_chars > max_chars {
                let remaining = max_chars.saturating_sub(total_chars);
                let header_chars = header.chars().count();
                if remaining > header_chars + 100 {
                    let truncated: String = result
                        .chunk
                        .text
                        .chars()
                        .take(remaining - header_chars - 20)
                        .collect();
                    context.push_str(&header);
                    context.push_str(&truncated);
                    context.push_str("\n... [truncated]\n");
                }
                break;
            }

            context.push_str(&entry);
            total_chars += entry_chars;
        }

        context.trim_end().to_string()
    }

    /// Context block for `query` using the configured `top_k`, or `None`
    /// when nothing relevant was found.
    pub async fn context_for(&self, query: &str) -> Option<String> {
        let results = self.retrieve(query, self.config.top_k).await;
        if results.is_empty() {
            return None;
        }
        Some(self.build_context(&results))
    }

    pub async fn remove_document(&self, document_id: &str) -> Result<usize> {
        self.index.remove_document(document_id).await
    }
}
