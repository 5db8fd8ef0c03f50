pub mod cache;
pub mod clients;
pub mod history;
pub mod prompt;
pub mod providers;
pub mod sse;

pub use cache::{CacheBackend, CacheEntry, CacheStats, MemoryBackend, ResponseCache};
pub use clients::{build_table, AnthropicClient, GeminiClient, OpenAiCompatibleClient};
pub use history::{
    compact_history, conversation_title, LatestResponse, LongestResponse, ResponseReducer,
};
pub use prompt::compose_system_prompt;
pub use providers::{
    CompletionRequest, Message, ProviderClient, ProviderInfo, ProviderTable, Role, TextStream,
};
