//! Word-boundary chunker with trailing-word overlap.
//!
//! Words accumulate into a chunk until its text reaches `target_chars`; the
//! next chunk then starts with the last `overlap_words` words of the one
//! just emitted. Indices are contiguous from 0.

use serde::{Deserialize, Serialize};

/// One bounded, ordered slice of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    /// Approximate; one token per word
    pub token_count: usize,
    /// Leading words repeated from the previous chunk
    pub overlap_words: usize,
}

impl DocumentChunk {
    /// The words this chunk contributes beyond its overlap
    pub fn fresh_words(&self) -> impl Iterator<Item = &str> {
        self.text.split_whitespace().skip(self.overlap_words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub target_chars: usize,
    pub overlap_words: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_chars: 500,
            overlap_words: 50,
        }
    }
}

pub fn chunk_text(document_id: &str, text: &str, config: &ChunkConfig) -> Vec<DocumentChunk> {
    let target = config.target_chars.max(1);
    let mut chunks = Vec::new();

    let mut current: Vec<&str> = Vec::new();
    let mut current_chars = 0usize;
    // How many words at the front of `current` came from the previous chunk
    let mut carried = 0usize;

    for word in text.split_whitespace() {
        if !current.is_empty() {
            current_chars += 1;
        }
        current_chars += word.chars().count();
        current.push(word);

        if current_chars >= target {
            chunks.push(make_chunk(document_id, chunks.len(), &current, carried));

            // Always drop at least one word so chunks cannot grow without bound
            let keep = config.overlap_words.min(current.len() - 1);
            current.drain(..current.len() - keep);
            carried = current.len();
            current_chars = joined_chars(&current);
        }
    }

    // A tail made only of carried words would duplicate the previous chunk
    if current.len() > carried {
        chunks.push(make_chunk(document_id, chunks.len(), &current, carried));
    }

    chunks
}

fn joined_chars(words: &[&str]) -> usize {
    words.iter().map(|w| w.chars().count()).sum::<usize>() + words.len().saturating_sub(1)
}

fn make_chunk(document_id: &str, index: usize, words: &[&str], overlap: usize) -> DocumentChunk {
    DocumentChunk {
        document_id: document_id.to_string(),
        chunk_index: index,
        text: words.join(" "),
        token_count: words.len(),
        overlap_words: overlap,
    }
}
