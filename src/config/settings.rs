use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::BreakerConfig;
use crate::rag::ChunkConfig;

/// Environment variable that points at an alternative config file.
pub const CONFIG_ENV: &str = "CHORUS_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub history: HistorySettings,

    #[serde(default)]
    pub rag: RagSettings,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    /// OpenAI chat completions and compatible APIs (xAI, Perplexity)
    OpenAi,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub display_name: String,
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// May contain a `{rag_context}` placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistorySettings {
    /// "longest" or "latest"
    #[serde(default = "default_reducer")]
    pub reducer: String,

    #[serde(default = "default_history_messages")]
    pub max_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagSettings {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,

    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,

    #[serde(default = "default_context_chars")]
    pub max_context_chars: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    OpenAi,
    /// Offline, deterministic; useful without network access
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSettings {
    #[serde(default = "default_embedding_kind")]
    pub provider: EmbeddingKind,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageSettings {
    /// Defaults to `chorus.db` in the project data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_open_timeout() -> u64 {
    60
}
fn default_call_timeout() -> u64 {
    30
}
fn default_stream_timeout() -> u64 {
    120
}
fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}
fn default_cache_entries() -> usize {
    1000
}
fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Sqlite
}
fn default_reducer() -> String {
    "longest".to_string()
}
fn default_history_messages() -> usize {
    20
}
fn default_chunk_chars() -> usize {
    500
}
fn default_overlap_words() -> usize {
    50
}
fn default_top_k() -> usize {
    3
}
fn default_context_chars() -> usize {
    8000
}
fn default_embedding_kind() -> EmbeddingKind {
    EmbeddingKind::OpenAi
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_embedding_dimension() -> usize {
    1536
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout(),
            call_timeout_secs: default_call_timeout(),
            stream_timeout_secs: default_stream_timeout(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
            backend: default_cache_backend(),
        }
    }
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            reducer: default_reducer(),
            max_messages: default_history_messages(),
        }
    }
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_words: default_overlap_words(),
            top_k: default_top_k(),
            min_score: None,
            max_context_chars: default_context_chars(),
        }
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_kind(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            base_url: None,
        }
    }
}

fn provider(
    kind: ProviderKind,
    display_name: &str,
    model: &str,
    base_url: Option<&str>,
    api_key_env: &str,
    temperature: Option<f32>,
    system_prompt: &str,
) -> ProviderConfig {
    ProviderConfig {
        kind,
        display_name: display_name.to_string(),
        model: model.to_string(),
        base_url: base_url.map(String::from),
        api_key: None,
        api_key_env: Some(api_key_env.to_string()),
        temperature,
        max_tokens: default_max_tokens(),
        enabled: true,
        system_prompt: Some(system_prompt.to_string()),
    }
}

impl Default for Settings {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "claude".to_string(),
            provider(
                ProviderKind::Anthropic,
                "Claude",
                "claude-sonnet-4-5-20250929",
                None,
                "ANTHROPIC_API_KEY",
                None,
                include_str!("../../prompts/claude.txt"),
            ),
        );
        providers.insert(
            "chatgpt".to_string(),
            provider(
                ProviderKind::OpenAi,
                "ChatGPT",
                "gpt-4o",
                Some("https://api.openai.com/v1"),
                "OPENAI_API_KEY",
                None,
                include_str!("../../prompts/chatgpt.txt"),
            ),
        );
        providers.insert(
            "gemini".to_string(),
            provider(
                ProviderKind::Gemini,
                "Gemini",
                "gemini-2.5-flash",
                Some("https://generativelanguage.googleapis.com/v1beta"),
                "GOOGLE_API_KEY",
                None,
                include_str!("../../prompts/gemini.txt"),
            ),
        );
        providers.insert(
            "grok".to_string(),
            provider(
                ProviderKind::OpenAi,
                "Grok",
                "grok-4-fast-reasoning",
                Some("https://api.x.ai/v1"),
                "XAI_API_KEY",
                Some(0.7),
                include_str!("../../prompts/grok.txt"),
            ),
        );
        providers.insert(
            "perplexity".to_string(),
            provider(
                ProviderKind::OpenAi,
                "Perplexity",
                "sonar",
                Some("https://api.perplexity.ai"),
                "PERPLEXITY_API_KEY",
                Some(0.2),
                include_str!("../../prompts/perplexity.txt"),
            ),
        );

        Self {
            providers,
            breaker: BreakerSettings::default(),
            cache: CacheSettings::default(),
            history: HistorySettings::default(),
            rag: RagSettings::default(),
            embedding: EmbeddingSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load from `path`, `$CHORUS_CONFIG`, or the per-user config file, in
    /// that order. A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = Self::resolve_path(path)?;

        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            let settings = Settings::default();
            settings.save_to(&config_path)?;
            tracing::info!(path = %config_path.display(), "wrote default configuration");
            Ok(settings)
        }
    }

    /// The file `load` reads for a given `--config` argument
    pub fn resolve_path(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Ok(PathBuf::from(path)),
                None => Self::config_path(),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Provider ids become a segment of cache keys (`chat_response:<id>:<digest>`),
    /// so they must be non-empty and free of `:` and whitespace.
    pub fn validate(&self) -> Result<()> {
        for id in self.providers.keys() {
            if id.is_empty() || id.contains(':') || id.chars().any(char::is_whitespace) {
                anyhow::bail!("Invalid provider id `{}`: ids may not be empty or contain ':' or spaces", id);
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "chorus", "chorus")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "chorus", "chorus")
            .context("Could not determine data directory")?;
        Ok(dirs.data_dir().to_path_buf())
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("chorus.db")),
        }
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    /// Enabled providers in id order
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, config)| config.enabled)
    }

    pub fn get_api_key(&self, provider: &ProviderConfig) -> Option<String> {
        resolve_key(provider.api_key.as_deref(), provider.api_key_env.as_deref())
    }

    pub fn embedding_api_key(&self) -> Option<String> {
        resolve_key(
            self.embedding.api_key.as_deref(),
            self.embedding.api_key_env.as_deref(),
        )
    }

    /// Per-provider system prompt templates
    pub fn prompt_templates(&self) -> BTreeMap<String, String> {
        self.providers
            .iter()
            .filter_map(|(id, config)| Some((id.clone(), config.system_prompt.clone()?)))
            .collect()
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            open_timeout: Duration::from_secs(self.breaker.open_timeout_secs),
            call_timeout: Duration::from_secs(self.breaker.call_timeout_secs),
        }
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker.stream_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            target_chars: self.rag.chunk_chars,
            overlap_words: self.rag.overlap_words,
        }
    }
}

fn resolve_key(key: Option<&str>, env_var: Option<&str>) -> Option<String> {
    if let Some(key) = key.filter(|k| !k.is_empty()) {
        return Some(key.to_string());
    }
    env_var
        .and_then(|var| std::env::var(var).ok())
        .filter(|k| !k.is_empty())
}
