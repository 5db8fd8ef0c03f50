//! Multi-provider AI fan-out: one prompt to many models in parallel, each
//! behind its own circuit breaker, with a shared response cache and
//! retrieval-augmented context from a local knowledge base.

pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod rag;
pub mod storage;
pub mod ui;

pub use crate::core::{DispatchRequest, ModelResponse, Orchestrator, StreamEvent};
pub use crate::error::{DispatchError, ProviderError};
