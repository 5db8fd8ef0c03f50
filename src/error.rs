// ============================================
// CHORUS - Error Taxonomy
// ============================================

use std::time::Duration;

use thiserror::Error;

/// Failure of one guarded provider call.
///
/// Never escapes the orchestrator: it is rendered into the failing
/// provider's `ModelResponse::error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{provider} circuit breaker is OPEN")]
    CircuitOpen { provider: String },

    #[error("{provider} circuit breaker is HALF_OPEN, trial call in progress")]
    TrialInProgress { provider: String },

    #[error("{provider} timed out after {}s", timeout.as_secs_f64())]
    Timeout { provider: String, timeout: Duration },

    #[error("{provider} error: {message}")]
    Remote { provider: String, message: String },

    #[error("{provider} request cancelled")]
    Cancelled { provider: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::CircuitOpen { provider }
            | Self::TrialInProgress { provider }
            | Self::Timeout { provider, .. }
            | Self::Remote { provider, .. }
            | Self::Cancelled { provider } => provider,
        }
    }

    /// True when the breaker rejected the call before any network activity.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::TrialInProgress { .. })
    }
}

/// Invalid arguments to `dispatch`; the only errors a dispatch returns.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    #[error("Prompt too long: {length} characters (maximum {max} allowed)")]
    PromptTooLong { length: usize, max: usize },

    #[error("Invalid model: {0}")]
    UnknownProvider(String),

    #[error("No providers configured")]
    NoProviders,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("embedding provider returned an empty vector")]
    EmptyEmbedding,

    #[error("nearest-neighbor lookup failed: {0}")]
    Index(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("invalid cache key pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_message() {
        let err = ProviderError::CircuitOpen {
            provider: "B".to_string(),
        };
        assert_eq!(err.to_string(), "B circuit breaker is OPEN");
        assert!(err.is_rejection());
        assert_eq!(err.provider(), "B");
    }

    #[test]
    fn test_timeout_message() {
        let err = ProviderError::Timeout {
            provider: "gemini".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "gemini timed out after 30s");
        assert!(!err.is_rejection());
    }
}
