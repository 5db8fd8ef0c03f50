mod settings;

pub use settings::{
    BreakerSettings, CacheBackendKind, CacheSettings, EmbeddingKind, EmbeddingSettings,
    HistorySettings, ProviderConfig, ProviderKind, RagSettings, Settings, StorageSettings,
    CONFIG_ENV,
};
