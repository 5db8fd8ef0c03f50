// ============================================
// CHORUS - Embeddings
// ============================================

mod provider;
mod store;

pub use provider::{EmbeddingProvider, HashEmbeddings, OpenAIEmbeddings};
pub use store::{MemoryIndex, ScoredChunk, VectorIndex};
pub(crate) use store::rank;

use anyhow::{bail, Result};

/// A vector tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
}

impl Embedding {
    pub fn new(vector: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            vector,
            model: model.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Reject vectors from another model or of another dimensionality
    pub fn ensure_compatible(&self, model: &str, dimension: usize) -> Result<()> {
        if self.model != model {
            bail!(
                "embedding model mismatch: index holds `{}`, got `{}`",
                model,
                self.model
            );
        }
        if self.vector.len() != dimension {
            bail!(
                "embedding dimension mismatch: index holds {}, got {}",
                dimension,
                self.vector.len()
            );
        }
        Ok(())
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Normalize a vector to unit length
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
