// ============================================
// CHORUS - Provider Clients
// ============================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::providers::{CompletionRequest, ProviderClient, ProviderTable, Role, TextStream};
use super::sse::{anthropic_delta, openai_delta, sse_deltas};
use crate::config::{ProviderConfig, ProviderKind, Settings};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

/// Fail with status and body on any non-2xx response.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("HTTP {}: {}", status, body.trim());
}

fn chat_messages(request: &CompletionRequest) -> Vec<Value> {
    request
        .conversation()
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

// ============================================================================
// ANTHROPIC
// ============================================================================

pub struct AnthropicClient {
    id: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    url: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(id: impl Into<String>, api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            id: id.into(),
            api_key,
            model,
            max_tokens,
            temperature: None,
            url: ANTHROPIC_URL.to_string(),
            http: http_client(),
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        if let Some(base_url) = base_url {
            self.url = format!("{}/messages", base_url.trim_end_matches('/'));
        }
        self
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": chat_messages(request),
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let json: Value = self.post(&self.body(request, false)).await?.json().await?;

        let content: String = json["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block["type"].as_str() == Some("text"))
                    .filter_map(|block| block["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();

        Ok(content)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<TextStream> {
        let response = self.post(&self.body(request, true)).await?;
        Ok(sse_deltas(response.bytes_stream(), anthropic_delta))
    }
}

// ============================================================================
// OPENAI-COMPATIBLE (ChatGPT, Grok, Perplexity)
// ============================================================================

pub struct OpenAiCompatibleClient {
    id: String,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(id: impl Into<String>, api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            id: id.into(),
            api_key,
            model,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            max_tokens: 4096,
            temperature: None,
            http: http_client(),
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": Role::System.as_str(), "content": system }));
        }
        messages.extend(chat_messages(request));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let json: Value = self.post(&self.body(request, false)).await?.json().await?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .context("response carried no message content")
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<TextStream> {
        let response = self.post(&self.body(request, true)).await?;
        Ok(sse_deltas(response.bytes_stream(), openai_delta))
    }
}

// ============================================================================
// GEMINI (no native streaming; the trait's one-shot adapter applies)
// ============================================================================

pub struct GeminiClient {
    id: String,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(id: impl Into<String>, api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            id: id.into(),
            api_key,
            model,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            max_tokens: 4096,
            temperature: None,
            http: http_client(),
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let contents: Vec<Value> = request
            .conversation()
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation = json!({ "maxOutputTokens": self.max_tokens });
        if let Some(temperature) = self.temperature {
            generation["temperature"] = json!(temperature);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if let Some(system) = &request.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.body(request))
            .send()
            .await?;
        let json: Value = ensure_success(response).await?.json().await?;

        let parts = json["candidates"][0]["content"]["parts"]
            .as_array()
            .context("response carried no candidates")?;

        Ok(parts.iter().filter_map(|p| p["text"].as_str()).collect())
    }
}

/// Build one client from its configuration.
pub fn build_client(id: &str, config: &ProviderConfig, api_key: String) -> Arc<dyn ProviderClient> {
    match config.kind {
        ProviderKind::Anthropic => Arc::new(
            AnthropicClient::new(id, api_key, config.model.clone(), config.max_tokens)
                .with_temperature(config.temperature)
                .with_base_url(config.base_url.clone()),
        ),
        ProviderKind::OpenAi => Arc::new(
            OpenAiCompatibleClient::new(id, api_key, config.model.clone(), config.base_url.clone())
                .with_limits(config.max_tokens, config.temperature),
        ),
        ProviderKind::Gemini => Arc::new(
            GeminiClient::new(id, api_key, config.model.clone(), config.base_url.clone())
                .with_limits(config.max_tokens, config.temperature),
        ),
    }
}

/// Provider table for every enabled provider that has credentials.
pub fn build_table(settings: &Settings) -> ProviderTable {
    let mut table = ProviderTable::new();

    for (id, config) in settings.enabled_providers() {
        match settings.get_api_key(config) {
            Some(key) => table.register(config.display_name.clone(), build_client(id, config, key)),
            None => tracing::warn!(
                provider = %id,
                env = config.api_key_env.as_deref().unwrap_or("-"),
                "no API key configured, skipping provider"
            ),
        }
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::Message;

    fn request() -> CompletionRequest {
        CompletionRequest::new("What is Rust?")
            .with_history(vec![Message::user("hi"), Message::assistant("hello")])
            .with_system(Some("Be brief.".into()))
    }

    #[test]
    fn test_anthropic_body_puts_system_at_top_level() {
        let client = AnthropicClient::new("claude", "k".into(), "claude-x".into(), 512);
        let body = client.body(&request(), true);

        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 512);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["content"], "What is Rust?");
    }

    #[test]
    fn test_openai_body_leads_with_system_message() {
        let client = OpenAiCompatibleClient::new("grok", "k".into(), "grok-x".into(), Some("https://api.x.ai/v1/".into()))
            .with_limits(100, Some(0.7));
        assert_eq!(client.base_url, "https://api.x.ai/v1");

        let body = client.body(&request(), false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[3]["role"], "user");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_gemini_body_maps_roles() {
        let client = GeminiClient::new("gemini", "k".into(), "gemini-x".into(), None);
        let body = client.body(&request());

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert!(!client.supports_streaming());
    }

    #[test]
    fn test_build_table_skips_providers_without_keys() {
        let mut settings = Settings::default();
        for config in settings.providers.values_mut() {
            config.api_key = None;
            config.api_key_env = Some("CHORUS_TEST_NO_SUCH_KEY".into());
        }
        settings.providers.get_mut("gemini").unwrap().api_key = Some("g".into());
        settings.providers.get_mut("claude").unwrap().api_key = Some("c".into());
        settings.providers.get_mut("claude").unwrap().enabled = false;

        let table = build_table(&settings);
        assert_eq!(table.ids(), vec!["gemini".to_string()]);
        assert_eq!(table.infos()[0].display_name, "Gemini");
    }
}
