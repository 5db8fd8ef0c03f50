use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::{cosine_similarity, Embedding};
use crate::rag::DocumentChunk;

/// Search hit with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// Nearest-neighbor index over chunk embeddings.
///
/// Every vector in one index shares a model tag and dimension; the first
/// insert fixes both.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn insert(&self, chunk: &DocumentChunk, embedding: &Embedding) -> Result<()>;

    /// Up to `k` chunks by descending cosine similarity; equal scores keep
    /// insertion order
    async fn nearest(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>>;

    /// Remove a document's chunks, returning how many went away
    async fn remove_document(&self, document_id: &str) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

/// Rank `(chunk, vector)` candidates against `query`.
pub(crate) fn rank<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<ScoredChunk>
where
    I: IntoIterator<Item = (&'a DocumentChunk, &'a [f32])>,
{
    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .map(|(chunk, vector)| ScoredChunk {
            chunk: chunk.clone(),
            score: cosine_similarity(query, vector),
        })
        .collect();

    // stable: ties stay in insertion order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

struct IndexedChunk {
    chunk: DocumentChunk,
    vector: Vec<f32>,
}

#[derive(Default)]
struct MemoryIndexInner {
    entries: Vec<IndexedChunk>,
    model: Option<(String, usize)>,
}

/// In-memory brute-force index
#[derive(Default)]
pub struct MemoryIndex {
    inner: RwLock<MemoryIndexInner>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn insert(&self, chunk: &DocumentChunk, embedding: &Embedding) -> Result<()> {
        if embedding.vector.is_empty() {
            bail!("refusing to index an empty vector");
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match &inner.model {
            Some((model, dimension)) => embedding.ensure_compatible(model, *dimension)?,
            None => inner.model = Some((embedding.model.clone(), embedding.dimension())),
        }

        inner.entries.push(IndexedChunk {
            chunk: chunk.clone(),
            vector: embedding.vector.clone(),
        });
        Ok(())
    }

    async fn nearest(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some((model, dimension)) = &inner.model else {
            return Ok(Vec::new());
        };
        query.ensure_compatible(model, *dimension)?;

        Ok(rank(
            &query.vector,
            inner
                .entries
                .iter()
                .map(|e| (&e.chunk, e.vector.as_slice())),
            k,
        ))
    }

    async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.entries.len();
        inner.entries.retain(|e| e.chunk.document_id != document_id);
        Ok(before - inner.entries.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len())
    }
}
