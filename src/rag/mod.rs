mod chunk;
mod retriever;

pub use chunk::{chunk_text, ChunkConfig, DocumentChunk};
pub use retriever::{Retriever, RetrieverConfig};
