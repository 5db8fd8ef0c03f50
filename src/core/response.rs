use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of one provider within one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub provider: String,
    /// Empty whenever `error` is set
    pub content: String,
    pub error: Option<String>,
    pub latency_ms: u64,
    /// Served from the response cache without a provider call
    #[serde(default)]
    pub cached: bool,
}

impl ModelResponse {
    pub fn success(provider: impl Into<String>, content: impl Into<String>, latency: Duration) -> Self {
        Self {
            provider: provider.into(),
            content: content.into(),
            error: None,
            latency_ms: latency.as_millis() as u64,
            cached: false,
        }
    }

    pub fn cached(provider: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            content: content.into(),
            error: None,
            latency_ms: 0,
            cached: true,
        }
    }

    pub fn failure(provider: impl Into<String>, error: impl Into<String>, latency: Duration) -> Self {
        Self {
            provider: provider.into(),
            content: String::new(),
            error: Some(error.into()),
            latency_ms: latency.as_millis() as u64,
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Events emitted by a streaming dispatch.
///
/// Per provider: one `ModelStart`, any number of ordered `ModelChunk`s, then
/// exactly one `ModelComplete` or `ModelError`. `AllComplete` comes last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ModelStart {
        provider: String,
    },
    ModelChunk {
        provider: String,
        content: String,
    },
    ModelComplete {
        provider: String,
        latency_ms: u64,
    },
    ModelError {
        provider: String,
        error: String,
        latency_ms: u64,
    },
    AllComplete,
}

impl StreamEvent {
    pub fn provider(&self) -> Option<&str> {
        match self {
            StreamEvent::ModelStart { provider }
            | StreamEvent::ModelChunk { provider, .. }
            | StreamEvent::ModelComplete { provider, .. }
            | StreamEvent::ModelError { provider, .. } => Some(provider),
            StreamEvent::AllComplete => None,
        }
    }

    /// True for the event that closes one provider's sequence
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ModelComplete { .. } | StreamEvent::ModelError { .. }
        )
    }
}
