// ============================================
// CHORUS - Fan-out Orchestrator
// ============================================

//! Sends one prompt to several providers at once and gathers every answer.
//!
//! Each provider runs as its own unit of work: cache lookup, breaker-guarded
//! call, cache store. The join waits for all of them; a failing provider
//! becomes an error entry in the result, never an error of the dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::metrics::Metrics;
use super::registry::CircuitRegistry;
use super::response::{ModelResponse, StreamEvent};
use crate::error::{DispatchError, ProviderError};
use crate::llm::cache::ResponseCache;
use crate::llm::prompt::compose_system_prompt;
use crate::llm::providers::{CompletionRequest, Message, ProviderClient, ProviderTable};

pub const MAX_PROMPT_CHARS: usize = 10_000;
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// One fan-out request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchRequest {
    pub prompt: String,
    pub history: Vec<Message>,
    /// Retrieved knowledge-base context, if any
    pub context: Option<String>,
    /// Requested provider ids; `None` selects the healthy providers
    pub providers: Option<Vec<String>>,
}

impl DispatchRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = Some(providers.into_iter().map(Into::into).collect());
        self
    }
}

pub struct Orchestrator {
    providers: Arc<ProviderTable>,
    breakers: Arc<CircuitRegistry>,
    cache: Arc<ResponseCache>,
    metrics: Arc<Metrics>,
    /// Per-provider system prompt templates
    prompts: BTreeMap<String, String>,
    stream_timeout: Duration,
    max_prompt_chars: usize,
}

impl Orchestrator {
    pub fn new(
        providers: Arc<ProviderTable>,
        breakers: Arc<CircuitRegistry>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            providers,
            breakers,
            cache,
            metrics: Arc::new(Metrics::new()),
            prompts: BTreeMap::new(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            max_prompt_chars: MAX_PROMPT_CHARS,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_prompts(mut self, prompts: BTreeMap<String, String>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    pub fn breakers(&self) -> &CircuitRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Validate the request and resolve the provider set.
    ///
    /// Requested ids are kept in request order, one unit of work per entry,
    /// repeats included. With none requested, every known provider whose breaker admits calls is
    /// used; if none does, all of them are, so open breakers get their trial.
    pub fn select_providers(&self, request: &DispatchRequest) -> Result<Vec<String>, DispatchError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(DispatchError::EmptyPrompt);
        }
        let length = prompt.chars().count();
        if length > self.max_prompt_chars {
            return Err(DispatchError::PromptTooLong {
                length,
                max: self.max_prompt_chars,
            });
        }

        match request.providers.as_deref() {
            Some(requested) if !requested.is_empty() => {
                if let Some(unknown) = requested.iter().find(|id| !self.providers.contains(id)) {
                    return Err(DispatchError::UnknownProvider(unknown.clone()));
                }
                Ok(requested.to_vec())
            }
            _ => {
                let all = self.providers.ids();
                if all.is_empty() {
                    return Err(DispatchError::NoProviders);
                }
                let healthy = self.breakers.healthy(&all);
                if healthy.is_empty() {
                    tracing::warn!("no healthy providers, trying all of them");
                    Ok(all)
                } else {
                    Ok(healthy)
                }
            }
        }
    }

    /// Fan `request` out and return one response per selected provider, in
    /// selection order.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelResponse>, DispatchError> {
        let selected = self.select_providers(request)?;
        tracing::info!(providers = ?selected, "dispatching prompt");

        let responses = join_all(
            selected
                .iter()
                .map(|id| self.complete_one(id, request, cancel)),
        )
        .await;

        let failed = responses.iter().filter(|r| !r.is_success()).count();
        tracing::info!(total = responses.len(), failed, "dispatch complete");
        Ok(responses)
    }

    /// Streaming fan-out: events go to `sink`, ending with `AllComplete`.
    ///
    /// A closed sink cancels the remaining provider calls.
    pub async fn dispatch_stream(
        &self,
        request: &DispatchRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelResponse>, DispatchError> {
        let selected = self.select_providers(request)?;
        tracing::info!(providers = ?selected, "streaming prompt");

        let cancel = cancel.child_token();
        let responses = join_all(
            selected
                .iter()
                .map(|id| self.stream_one(id, request, &sink, &cancel)),
        )
        .await;

        let _ = sink.send(StreamEvent::AllComplete).await;
        Ok(responses)
    }

    fn prepare(&self, provider_id: &str, request: &DispatchRequest) -> (String, CompletionRequest) {
        let key = ResponseCache::key(
            provider_id,
            &request.prompt,
            &request.history,
            request.context.as_deref(),
        );
        let system = compose_system_prompt(
            self.prompts.get(provider_id).map(String::as_str),
            request.context.as_deref(),
        );
        let completion = CompletionRequest::new(request.prompt.trim())
            .with_history(request.history.clone())
            .with_system(system);
        (key, completion)
    }

    fn client(&self, provider_id: &str) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.providers
            .get(provider_id)
            .ok_or_else(|| ProviderError::Remote {
                provider: provider_id.to_string(),
                message: "provider is not registered".to_string(),
            })
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let hit = self.cache.get(key).await;
        self.metrics
            .increment(if hit.is_some() { "cache.hit" } else { "cache.miss" });
        hit
    }

    fn record_outcome(&self, provider_id: &str, outcome: &Result<String, ProviderError>, latency: Duration) {
        match outcome {
            Ok(_) => {
                tracing::debug!(provider = provider_id, latency_ms = latency.as_millis() as u64, "provider answered");
                self.metrics.record_provider(provider_id, true, latency);
            }
            Err(ProviderError::Cancelled { .. }) => {
                tracing::debug!(provider = provider_id, "provider call cancelled");
            }
            Err(e) if e.is_rejection() => {
                tracing::info!(provider = provider_id, "{}", e);
                self.metrics
                    .increment(&format!("provider.{}.rejected", provider_id));
            }
            Err(e) => {
                tracing::warn!(provider = provider_id, error = %e, "provider call failed");
                self.metrics.record_provider(provider_id, false, latency);
            }
        }
    }

    async fn complete_one(
        &self,
        provider_id: &str,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> ModelResponse {
        let started = Instant::now();
        let (key, completion) = self.prepare(provider_id, request);

        if let Some(content) = self.cached(&key).await {
            return ModelResponse::cached(provider_id, content);
        }

        let outcome = match self.client(provider_id) {
            Ok(client) => {
                let breaker = self.breakers.get(provider_id);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled {
                        provider: provider_id.to_string(),
                    }),
                    result = breaker.call(|| client.complete(&completion)) => result,
                }
            }
            Err(e) => Err(e),
        };

        let latency = started.elapsed();
        self.record_outcome(provider_id, &outcome, latency);

        match outcome {
            Ok(content) => {
                self.cache.set(&key, &content).await;
                ModelResponse::success(provider_id, content, latency)
            }
            Err(e) => ModelResponse::failure(provider_id, e.to_string(), latency),
        }
    }

    async fn stream_one(
        &self,
        provider_id: &str,
        request: &DispatchRequest,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> ModelResponse {
        let started = Instant::now();
        let provider = provider_id.to_string();
        let _ = sink
            .send(StreamEvent::ModelStart {
                provider: provider.clone(),
            })
            .await;

        let (key, completion) = self.prepare(provider_id, request);

        if let Some(content) = self.cached(&key).await {
            let _ = sink
                .send(StreamEvent::ModelChunk {
                    provider: provider.clone(),
                    content: content.clone(),
                })
                .await;
            let _ = sink
                .send(StreamEvent::ModelComplete {
                    provider,
                    latency_ms: 0,
                })
                .await;
            return ModelResponse::cached(provider_id, content);
        }

        let outcome = match self.client(provider_id) {
            Ok(client) => {
                let breaker = self.breakers.get(provider_id);
                let (client, completion, provider) = (&client, &completion, &provider);
                let relay = || async move {
                    let mut deltas = client.stream(completion).await?;
                    let mut full = String::new();
                    while let Some(delta) = deltas.next().await {
                        let delta = delta?;
                        if delta.is_empty() {
                            continue;
                        }
                        full.push_str(&delta);
                        let event = StreamEvent::ModelChunk {
                            provider: provider.clone(),
                            content: delta,
                        };
                        if sink.send(event).await.is_err() {
                            // Nobody is listening: park until the cancellation branch wins
                            cancel.cancel();
                            std::future::pending::<()>().await;
                        }
                    }
                    Ok(full)
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled {
                        provider: provider_id.to_string(),
                    }),
                    result = breaker.call_with_timeout(self.stream_timeout, relay) => result,
                }
            }
            Err(e) => Err(e),
        };

        let latency = started.elapsed();
        self.record_outcome(provider_id, &outcome, latency);

        match outcome {
            Ok(content) => {
                self.cache.set(&key, &content).await;
                let _ = sink
                    .send(StreamEvent::ModelComplete {
                        provider,
                        latency_ms: latency.as_millis() as u64,
                    })
                    .await;
                ModelResponse::success(provider_id, content, latency)
            }
            Err(e) => {
                let response = ModelResponse::failure(provider_id, e.to_string(), latency);
                let _ = sink
                    .send(StreamEvent::ModelError {
                        provider,
                        error: e.to_string(),
                        latency_ms: response.latency_ms,
                    })
                    .await;
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BreakerConfig, CircuitState};
    use crate::llm::providers::TextStream;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        id: &'static str,
        reply: Result<&'static str, &'static str>,
        delay: Duration,
        calls: AtomicUsize,
        last_system: std::sync::Mutex<Option<String>>,
    }

    impl Scripted {
        fn ok(id: &'static str, reply: &'static str) -> Arc<Self> {
            Self::build(id, Ok(reply), Duration::ZERO)
        }

        fn failing(id: &'static str) -> Arc<Self> {
            Self::build(id, Err("upstream 500"), Duration::ZERO)
        }

        fn slow(id: &'static str, delay: Duration) -> Arc<Self> {
            Self::build(id, Ok("late"), delay)
        }

        fn build(id: &'static str, reply: Result<&'static str, &'static str>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id,
                reply,
                delay,
                calls: AtomicUsize::new(0),
                last_system: std::sync::Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_system.lock().unwrap() = request.system.clone();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.reply {
                Ok(text) => Ok(text.to_string()),
                Err(message) => anyhow::bail!(message),
            }
        }

        fn supports_streaming(&self) -> bool {
            true
        }

        async fn stream(&self, request: &CompletionRequest) -> Result<TextStream> {
            let text = self.complete(request).await?;
            let words: Vec<Result<String>> = text
                .split_inclusive(' ')
                .map(|w| Ok(w.to_string()))
                .collect();
            Ok(stream::iter(words).boxed())
        }
    }

    fn orchestrator(clients: &[Arc<Scripted>], config: BreakerConfig) -> Orchestrator {
        let mut table = ProviderTable::new();
        for client in clients {
            table.register(client.id.to_uppercase(), client.clone());
        }
        Orchestrator::new(
            Arc::new(table),
            Arc::new(CircuitRegistry::new(config)),
            Arc::new(ResponseCache::in_memory(100, Duration::from_secs(3600))),
        )
    }

    fn fast_breaker() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_order_and_size() {
        let a = Scripted::ok("a", "alpha");
        let b = Scripted::failing("b");
        let c = Scripted::ok("c", "gamma");
        let orch = orchestrator(&[a, b, c], BreakerConfig::default());

        let request = DispatchRequest::new("hello").with_providers(["a", "b", "c"]);
        let responses = orch.dispatch(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].content, "alpha");
        assert!(responses[0].error.is_none());
        assert_eq!(responses[1].provider, "b");
        assert!(responses[1].content.is_empty());
        assert_eq!(responses[1].error.as_deref(), Some("b error: upstream 500"));
        assert_eq!(responses[2].content, "gamma");
    }

    #[tokio::test]
    async fn test_open_breaker_scenario() {
        let a = Scripted::ok("A", "pong");
        let b = Scripted::ok("B", "never");
        let orch = orchestrator(&[a, b.clone()], fast_breaker());

        let _ = orch
            .breakers()
            .get("B")
            .call(|| async { Err::<(), _>(anyhow::anyhow!("down")) })
            .await;
        assert_eq!(orch.breakers().get("B").state(), CircuitState::Open);

        let request = DispatchRequest::new("ping").with_providers(["A", "B"]);
        let responses = orch.dispatch(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(responses[0].content, "pong");
        assert!(responses[0].is_success());
        assert_eq!(responses[1].content, "");
        assert_eq!(responses[1].error.as_deref(), Some("B circuit breaker is OPEN"));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider_and_breaker() {
        let a = Scripted::ok("a", "fresh");
        let orch = orchestrator(&[a.clone()], fast_breaker());
        let request = DispatchRequest::new("What is Rust?").with_providers(["a"]);

        let first = orch.dispatch(&request, &CancellationToken::new()).await.unwrap();
        assert!(!first[0].cached);

        // Same question, different casing and padding
        let again = DispatchRequest::new("  what is rust?").with_providers(["a"]);
        let second = orch.dispatch(&again, &CancellationToken::new()).await.unwrap();

        assert!(second[0].cached);
        assert_eq!(second[0].latency_ms, 0);
        assert_eq!(second[0].content, "fresh");
        assert_eq!(a.calls(), 1);
        assert_eq!(orch.metrics().get_counter("cache.hit"), 1);
        assert_eq!(orch.metrics().get_counter("cache.miss"), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let b = Scripted::failing("b");
        let orch = orchestrator(&[b.clone()], BreakerConfig::default());
        let request = DispatchRequest::new("q").with_providers(["b"]);

        orch.dispatch(&request, &CancellationToken::new()).await.unwrap();
        orch.dispatch(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(b.calls(), 2);
        assert_eq!(orch.metrics().get_counter("provider.b.failure"), 2);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_without_delaying_others() {
        let fast = Scripted::ok("fast", "quick");
        let slow = Scripted::slow("slow", Duration::from_secs(5));
        let orch = orchestrator(&[fast, slow], fast_breaker());

        let started = Instant::now();
        let request = DispatchRequest::new("go").with_providers(["slow", "fast"]);
        let responses = orch.dispatch(&request, &CancellationToken::new()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(responses[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(responses[1].content, "quick");
        assert_eq!(orch.breakers().get("slow").state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_default_selection_skips_open_then_falls_back_to_all() {
        let a = Scripted::ok("a", "x");
        let b = Scripted::ok("b", "y");
        let orch = orchestrator(&[a, b], fast_breaker());

        let trip = |id: &'static str| {
            let breaker = orch.breakers().get(id);
            async move {
                let _ = breaker
                    .call(|| async { Err::<(), _>(anyhow::anyhow!("down")) })
                    .await;
            }
        };

        trip("a").await;
        let request = DispatchRequest::new("hi");
        assert_eq!(orch.select_providers(&request).unwrap(), vec!["b".to_string()]);

        trip("b").await;
        assert_eq!(
            orch.select_providers(&request).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let orch = orchestrator(&[Scripted::ok("a", "x")], fast_breaker());
        let token = CancellationToken::new();

        let empty = orch.dispatch(&DispatchRequest::new("   "), &token).await;
        assert_eq!(empty.unwrap_err(), DispatchError::EmptyPrompt);

        let long = orch.dispatch(&DispatchRequest::new("x".repeat(10_001)), &token).await;
        assert!(matches!(long.unwrap_err(), DispatchError::PromptTooLong { length: 10_001, .. }));

        let unknown = DispatchRequest::new("hi").with_providers(["a", "nope"]);
        assert_eq!(
            orch.dispatch(&unknown, &token).await.unwrap_err(),
            DispatchError::UnknownProvider("nope".into())
        );

        let none = Orchestrator::new(
            Arc::new(ProviderTable::new()),
            Arc::new(CircuitRegistry::default()),
            Arc::new(ResponseCache::disabled()),
        );
        assert_eq!(
            none.dispatch(&DispatchRequest::new("hi"), &token).await.unwrap_err(),
            DispatchError::NoProviders
        );
    }

    #[tokio::test]
    async fn test_repeated_provider_gets_one_result_per_entry() {
        let a = Scripted::slow("a", Duration::from_millis(20));
        let b = Scripted::ok("b", "y");
        let orch = orchestrator(&[a.clone(), b], fast_breaker());
        let request = DispatchRequest::new("hi").with_providers(["a", "b", "a"]);

        let responses = orch.dispatch(&request, &CancellationToken::new()).await.unwrap();
        let order: Vec<&str> = responses.iter().map(|r| r.provider.as_str()).collect();
        assert_eq!(order, ["a", "b", "a"]);
        assert!(responses.iter().all(|r| r.is_success()));
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_context_reaches_system_prompt() {
        let a = Scripted::ok("a", "x");
        let orch = orchestrator(&[a.clone()], fast_breaker()).with_prompts(BTreeMap::from([(
            "a".to_string(),
            "You are A.\n{rag_context}".to_string(),
        )]));

        let request = DispatchRequest::new("hi")
            .with_context(Some("[Document 1] facts".into()))
            .with_providers(["a"]);
        orch.dispatch(&request, &CancellationToken::new()).await.unwrap();

        let system = a.last_system.lock().unwrap().clone().unwrap();
        assert!(system.starts_with("You are A."));
        assert!(system.contains("[Document 1] facts"));
    }

    #[tokio::test]
    async fn test_cancellation_ends_calls_without_tripping_breaker() {
        let slow = Scripted::slow("slow", Duration::from_secs(30));
        let config = BreakerConfig {
            call_timeout: Duration::from_secs(60),
            ..fast_breaker()
        };
        let orch = orchestrator(&[slow], config);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let request = DispatchRequest::new("hi").with_providers(["slow"]);
        let responses = orch.dispatch(&request, &token).await.unwrap();

        assert_eq!(responses[0].error.as_deref(), Some("slow request cancelled"));
        let breaker = orch.breakers().get("slow");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_event_sequence() {
        let a = Scripted::ok("a", "one two three");
        let b = Scripted::failing("b");
        let orch = orchestrator(&[a, b], BreakerConfig::default());

        let (tx, mut rx) = mpsc::channel(64);
        let request = DispatchRequest::new("count").with_providers(["a", "b"]);
        let responses = orch
            .dispatch_stream(&request, tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.last(), Some(&StreamEvent::AllComplete));

        let a_events: Vec<&StreamEvent> = events.iter().filter(|e| e.provider() == Some("a")).collect();
        assert_eq!(a_events[0], &StreamEvent::ModelStart { provider: "a".into() });
        let text: String = a_events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ModelChunk { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "one two three");
        assert!(matches!(a_events.last(), Some(StreamEvent::ModelComplete { .. })));
        assert_eq!(a_events.iter().filter(|e| e.is_terminal()).count(), 1);

        let b_events: Vec<&StreamEvent> = events.iter().filter(|e| e.provider() == Some("b")).collect();
        assert_eq!(b_events.len(), 2);
        assert!(matches!(b_events[1], StreamEvent::ModelError { .. }));

        assert_eq!(responses[0].content, "one two three");
        assert!(responses[1].error.is_some());
    }

    #[tokio::test]
    async fn test_stream_cache_hit_emits_single_chunk() {
        let a = Scripted::ok("a", "cached answer");
        let orch = orchestrator(&[a.clone()], BreakerConfig::default());
        let request = DispatchRequest::new("q").with_providers(["a"]);
        orch.dispatch(&request, &CancellationToken::new()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        orch.dispatch_stream(&request, tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::ModelStart { provider: "a".into() },
                StreamEvent::ModelChunk {
                    provider: "a".into(),
                    content: "cached answer".into()
                },
                StreamEvent::ModelComplete {
                    provider: "a".into(),
                    latency_ms: 0
                },
                StreamEvent::AllComplete,
            ]
        );
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_closed_sink_cancels_stream() {
        let a = Scripted::ok("a", "many words to stream here");
        let orch = orchestrator(&[a], BreakerConfig::default());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let request = DispatchRequest::new("q").with_providers(["a"]);
        let responses = orch
            .dispatch_stream(&request, tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(responses[0].error.as_deref(), Some("a request cancelled"));
        assert_eq!(orch.breakers().get("a").failure_count(), 0);
    }
}
