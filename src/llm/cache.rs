// ============================================
// CHORUS - Provider Response Cache
// ============================================

//! Content-addressed cache in front of provider calls.
//!
//! Entries live for a fixed TTL from creation; a hit never extends it.
//! Every backend failure degrades to a miss.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::providers::Message;
use crate::error::CacheError;

pub const CACHE_KEY_PREFIX: &str = "chat_response";
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Messages of recent history (three exchanges) folded into the key
const HISTORY_WINDOW: usize = 6;
/// Characters of each history message folded into the key
const HISTORY_PREVIEW_CHARS: usize = 100;
/// Hex characters of the digest kept in the key
const DIGEST_CHARS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: String,
    pub created_at: SystemTime,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(payload: impl Into<String>, ttl: Duration) -> Self {
        Self {
            payload: payload.into(),
            created_at: SystemTime::now(),
            ttl,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.created_at).unwrap_or_default() > self.ttl
    }
}

/// Storage behind [`ResponseCache`]. Writes must be atomic per key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every key matching `pattern`, returning how many went away
    async fn remove_matching(&self, pattern: &Regex) -> Result<usize, CacheError>;

    /// Keys of entries that have not expired
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
}

/// Bounded in-process backend.
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Drop expired entries; only if that frees nothing, drop the oldest live one
    fn evict(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        let now = SystemTime::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        if entries.len() < max_entries {
            return;
        }

        if let Some(oldest) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(key, _)| key.clone())
        {
            entries.remove(&oldest);
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            Self::evict(&mut entries, self.max_entries);
        }
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    async fn remove_matching(&self, pattern: &Regex) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !pattern.is_match(key));
        Ok(before - entries.len())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let now = SystemTime::now();
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub total_entries: usize,
    pub per_provider: BTreeMap<String, usize>,
    pub ttl_secs: u64,
}

/// Response cache. A cache without a backend always misses.
pub struct ResponseCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::in_memory(1000, DEFAULT_TTL)
    }
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend: Some(backend),
            ttl,
        }
    }

    pub fn in_memory(max_entries: usize, ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryBackend::new(max_entries)), ttl)
    }

    pub fn disabled() -> Self {
        Self {
            backend: None,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Derive the cache key for one provider call.
    ///
    /// Folds in the normalized prompt, the provider id, a bounded summary of
    /// the last few history messages and a digest of the retrieved context.
    pub fn key(provider: &str, prompt: &str, history: &[Message], context: Option<&str>) -> String {
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        let history_summary: Vec<serde_json::Value> = history[start..]
            .iter()
            .map(|msg| {
                let preview: String = msg
                    .content
                    .trim()
                    .to_lowercase()
                    .chars()
                    .take(HISTORY_PREVIEW_CHARS)
                    .collect();
                serde_json::json!({ "role": msg.role, "content_preview": preview })
            })
            .collect();

        let context_digest = context
            .filter(|c| !c.trim().is_empty())
            .map(|c| hex::encode(Sha256::digest(c.as_bytes())));

        // serde_json maps are ordered by key, so this encoding is stable
        let material = serde_json::json!({
            "prompt": prompt.trim().to_lowercase(),
            "provider": provider,
            "history_summary": history_summary,
            "context_digest": context_digest,
        });

        let digest = hex::encode(Sha256::digest(material.to_string().as_bytes()));
        format!("{}:{}:{}", CACHE_KEY_PREFIX, provider, &digest[..DIGEST_CHARS])
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let backend = self.backend.as_ref()?;

        match backend.get(key).await {
            Ok(Some(entry)) if entry.is_expired(SystemTime::now()) => {
                tracing::debug!(key, "cache entry expired");
                if let Err(e) = backend.remove(key).await {
                    tracing::warn!("cache remove error: {}", e);
                }
                None
            }
            Ok(Some(entry)) => {
                tracing::debug!(key, "cache hit");
                Some(entry.payload)
            }
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                None
            }
            Err(e) => {
                tracing::warn!("cache get error: {}", e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, payload: &str) -> bool {
        self.set_with_ttl(key, payload, self.ttl).await
    }

    /// Store `payload`; empty payloads are never cached
    pub async fn set_with_ttl(&self, key: &str, payload: &str, ttl: Duration) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        if payload.is_empty() {
            return false;
        }

        match backend.set(key, CacheEntry::new(payload, ttl)).await {
            Ok(()) => {
                tracing::debug!(key, "cached response");
                true
            }
            Err(e) => {
                tracing::warn!("cache set error: {}", e);
                false
            }
        }
    }

    /// Remove entries whose key matches a `*` glob (all responses by default)
    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };

        let default_pattern = format!("{}:*", CACHE_KEY_PREFIX);
        let pattern = pattern.unwrap_or(default_pattern.as_str());
        let result = match glob_to_regex(pattern) {
            Ok(regex) => backend.remove_matching(&regex).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(removed) => {
                tracing::info!(pattern, removed, "cleared cache entries");
                removed
            }
            Err(e) => {
                tracing::warn!("cache clear error: {}", e);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let ttl_secs = self.ttl.as_secs();
        let Some(backend) = self.backend.as_ref() else {
            return CacheStats {
                ttl_secs,
                ..CacheStats::default()
            };
        };

        let keys = match backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("cache stats error: {}", e);
                return CacheStats {
                    ttl_secs,
                    ..CacheStats::default()
                };
            }
        };

        let mut per_provider = BTreeMap::new();
        let mut total_entries = 0;
        for key in &keys {
            let mut parts = key.splitn(3, ':');
            if parts.next() != Some(CACHE_KEY_PREFIX) {
                continue;
            }
            total_entries += 1;
            if let Some(provider) = parts.next() {
                *per_provider.entry(provider.to_string()).or_insert(0) += 1;
            }
        }

        CacheStats {
            enabled: true,
            total_entries,
            per_provider,
            ttl_secs,
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let body = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", body)).map_err(|source| CacheError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _entry: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn remove(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn remove_matching(&self, _pattern: &Regex) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_cache_set_get() {
        let cache = ResponseCache::in_memory(10, Duration::from_secs(3600));
        assert!(cache.set("k", "pong").await);
        assert_eq!(cache.get("k").await, Some("pong".to_string()));
        assert_eq!(cache.get("other").await, None);
    }

    #[tokio::test]
    async fn test_cache_entry_expires() {
        let cache = ResponseCache::in_memory(10, Duration::from_secs(3600));
        cache
            .set_with_ttl("k", "pong", Duration::from_millis(30))
            .await;
        assert_eq!(cache.get("k").await, Some("pong".to_string()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn test_hit_does_not_extend_ttl() {
        let cache = ResponseCache::in_memory(10, Duration::from_secs(3600));
        cache
            .set_with_ttl("k", "v", Duration::from_millis(60))
            .await;

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_prefers_expired_entries() {
        let backend = MemoryBackend::new(2);
        backend
            .set("expired", CacheEntry::new("old", Duration::from_millis(5)))
            .await
            .unwrap();
        backend
            .set("live", CacheEntry::new("kept", Duration::from_secs(3600)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend
            .set("new", CacheEntry::new("fresh", Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(backend.get("live").await.unwrap().unwrap().payload, "kept");
        assert!(backend.get("new").await.unwrap().is_some());
        assert!(backend.get("expired").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_payload_not_cached() {
        let cache = ResponseCache::default();
        assert!(!cache.set("k", "").await);
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_to_miss() {
        let cache = ResponseCache::new(Arc::new(BrokenBackend), DEFAULT_TTL);
        assert!(!cache.set("k", "v").await);
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.clear(None).await, 0);
        assert!(!cache.stats().await.enabled);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = ResponseCache::disabled();
        assert!(!cache.set("k", "v").await);
        assert_eq!(cache.get("k").await, None);
    }

    #[test]
    fn test_key_normalizes_prompt() {
        let a = ResponseCache::key("claude", "  Hello World ", &[], None);
        let b = ResponseCache::key("claude", "hello world", &[], None);
        assert_eq!(a, b);
        assert!(a.starts_with("chat_response:claude:"));
        assert_ne!(a, ResponseCache::key("gemini", "hello world", &[], None));
    }

    #[test]
    fn test_key_includes_context_digest() {
        let none = ResponseCache::key("claude", "q", &[], None);
        let blank = ResponseCache::key("claude", "q", &[], Some("   "));
        let ctx = ResponseCache::key("claude", "q", &[], Some("[Document 1] rust"));
        assert_eq!(none, blank);
        assert_ne!(none, ctx);
    }

    #[test]
    fn test_key_ignores_history_beyond_window() {
        let recent: Vec<Message> = (0..HISTORY_WINDOW)
            .map(|i| Message::user(format!("turn {}", i)))
            .collect();

        let mut long = vec![Message::user("ancient"), Message::assistant("reply")];
        long.extend(recent.iter().cloned());

        assert_eq!(
            ResponseCache::key("claude", "q", &recent, None),
            ResponseCache::key("claude", "q", &long, None)
        );

        let mut changed = recent.clone();
        changed[HISTORY_WINDOW - 1] = Message::user("different");
        assert_ne!(
            ResponseCache::key("claude", "q", &recent, None),
            ResponseCache::key("claude", "q", &changed, None)
        );
    }

    #[test]
    fn test_key_truncates_history_preview() {
        let base = "x".repeat(HISTORY_PREVIEW_CHARS);
        let a = vec![Message::user(format!("{}tail one", base))];
        let b = vec![Message::user(format!("{}tail two", base))];
        assert_eq!(
            ResponseCache::key("claude", "q", &a, None),
            ResponseCache::key("claude", "q", &b, None)
        );
    }

    #[tokio::test]
    async fn test_clear_by_pattern_and_stats() {
        let cache = ResponseCache::default();
        let k1 = ResponseCache::key("claude", "one", &[], None);
        let k2 = ResponseCache::key("claude", "two", &[], None);
        let k3 = ResponseCache::key("grok", "one", &[], None);
        for key in [&k1, &k2, &k3] {
            cache.set(key, "payload").await;
        }

        let stats = cache.stats().await;
        assert!(stats.enabled);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.per_provider["claude"], 2);
        assert_eq!(stats.per_provider["grok"], 1);
        assert_eq!(stats.ttl_secs, 86400);

        assert_eq!(cache.clear(Some("chat_response:claude:*")).await, 2);
        assert_eq!(cache.get(&k3).await, Some("payload".to_string()));
        assert_eq!(cache.clear(None).await, 1);
    }

    #[tokio::test]
    async fn test_memory_backend_evicts_when_full() {
        let backend = MemoryBackend::new(2);
        backend.set("a", CacheEntry::new("1", DEFAULT_TTL)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        backend.set("b", CacheEntry::new("2", DEFAULT_TTL)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        backend.set("c", CacheEntry::new("3", DEFAULT_TTL)).await.unwrap();

        assert!(backend.get("a").await.unwrap().is_none());
        assert!(backend.get("c").await.unwrap().is_some());
        assert_eq!(backend.keys().await.unwrap().len(), 2);
    }

    #[test]
    fn test_glob_to_regex_escapes() {
        let re = glob_to_regex("chat_response:claude:*").unwrap();
        assert!(re.is_match("chat_response:claude:abc"));
        assert!(!re.is_match("chat_response:grok:abc"));
        assert!(!glob_to_regex("a.b").unwrap().is_match("axb"));
    }
}
