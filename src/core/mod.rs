mod circuit_breaker;
mod metrics;
mod orchestrator;
mod registry;
mod response;

pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use metrics::{Metrics, MetricsSummary, TimingStats};
pub use orchestrator::{DispatchRequest, Orchestrator, MAX_PROMPT_CHARS};
pub use registry::CircuitRegistry;
pub use response::{ModelResponse, StreamEvent};
