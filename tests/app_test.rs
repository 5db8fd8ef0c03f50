// ============================================
// CHORUS - Ask Flow Integration Tests
// ============================================

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus::app::{App, AskOptions};
use chorus::config::{CacheBackendKind, Settings};
use chorus::core::CircuitState;
use chorus::embeddings::HashEmbeddings;
use chorus::llm::{CompletionRequest, Message, ProviderClient, ProviderTable, Role};
use chorus::storage::{ConversationStore, SqliteStore};

/// Records every request it receives.
struct Recorder {
    id: &'static str,
    answer: Option<&'static str>,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl Recorder {
    fn answering(id: &'static str, answer: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            answer: Some(answer),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(id: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            answer: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for Recorder {
    fn id(&self) -> &str {
        self.id
    }

    fn model_name(&self) -> &str {
        "recorder"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.seen.lock().unwrap().push(request.clone());
        match self.answer {
            Some(answer) => Ok(answer.to_string()),
            None => anyhow::bail!("HTTP 500: internal error"),
        }
    }
}

fn app_with(providers: &[Arc<Recorder>]) -> (App, Arc<SqliteStore>) {
    let mut settings = Settings::default();
    settings.cache.backend = CacheBackendKind::Memory;
    settings.providers.clear();

    let mut table = ProviderTable::new();
    for provider in providers {
        table.register(provider.id.to_uppercase(), provider.clone());
    }

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let app = App::with_components(settings, table, store.clone(), Arc::new(HashEmbeddings::new(128)));
    (app, store)
}

#[tokio::test]
async fn test_ask_persists_prompt_and_successful_replies() {
    let (app, store) = app_with(&[Recorder::answering("claude", "Hi!"), Recorder::failing("grok")]);

    let outcome = app
        .ask("Say hello", &AskOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.responses.len(), 2);
    assert_eq!(outcome.conversation.title, "Say hello");

    let messages = store.messages(&outcome.conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Say hello");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].provider.as_deref(), Some("claude"));
    assert_eq!(messages[1].content, "Hi!");
}

#[tokio::test]
async fn test_follow_up_sends_compacted_history() {
    let claude = Recorder::answering("claude", "a short answer");
    let gemini = Recorder::answering("gemini", "a considerably longer answer");
    let (app, _store) = app_with(&[claude.clone(), gemini]);
    let token = CancellationToken::new();

    let first = app
        .ask("First question", &AskOptions::default(), None, &token)
        .await
        .unwrap();

    let options = AskOptions {
        providers: vec!["claude".into()],
        conversation: Some(first.conversation.id.clone()),
        ..AskOptions::default()
    };
    let second = app.ask("Second question", &options, None, &token).await.unwrap();
    assert_eq!(second.conversation.id, first.conversation.id);

    let last = claude.requests().pop().unwrap();
    assert_eq!(
        last.history,
        vec![
            Message::user("First question"),
            Message::assistant("a considerably longer answer"),
        ]
    );
    assert_eq!(last.prompt, "Second question");
}

#[tokio::test]
async fn test_rag_context_reaches_system_prompt() {
    let claude = Recorder::answering("claude", "ok");
    let (app, _store) = app_with(&[claude.clone()]);

    let document = app
        .ingest_text(
            "tomatoes",
            None,
            "Tomatoes need full sun and deep watering twice a week.",
            |_, _| {},
        )
        .await
        .unwrap();
    assert_eq!(document.chunk_count, 1);

    let options = AskOptions {
        rag: true,
        ..AskOptions::default()
    };
    let outcome = app
        .ask("How often should tomatoes get watering?", &options, None, &CancellationToken::new())
        .await
        .unwrap();

    let context = outcome.context.unwrap();
    assert!(context.contains("Tomatoes need full sun"));

    let system = claude.requests()[0].system.clone().unwrap();
    assert!(system.starts_with("You are a helpful assistant with access to a knowledge base."));
    assert!(system.contains("Tomatoes need full sun"));
}

#[tokio::test]
async fn test_streamed_ask_is_persisted_too() {
    let (app, store) = app_with(&[Recorder::answering("claude", "streamed")]);
    let (tx, mut rx) = mpsc::channel(16);

    let outcome = app
        .ask("stream please", &AskOptions::default(), Some(tx), &CancellationToken::new())
        .await
        .unwrap();

    let mut events = 0;
    while rx.recv().await.is_some() {
        events += 1;
    }
    assert_eq!(events, 4);

    let messages = store.messages(&outcome.conversation.id).await.unwrap();
    assert_eq!(messages.last().unwrap().content, "streamed");
}

#[tokio::test]
async fn test_invalid_prompt_creates_nothing() {
    let (app, store) = app_with(&[Recorder::answering("claude", "x")]);

    let err = app
        .ask("   ", &AskOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Prompt cannot be empty");
    assert!(store.list_conversations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_conversation_is_an_error() {
    let (app, _store) = app_with(&[Recorder::answering("claude", "x")]);
    let options = AskOptions {
        conversation: Some("missing".into()),
        ..AskOptions::default()
    };

    let err = app
        .ask("hi", &options, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Conversation not found"));
}

#[tokio::test]
async fn test_forget_and_providers_listing() {
    let (app, _store) = app_with(&[Recorder::answering("claude", "x")]);
    app.ingest_text("notes", Some("notes.txt"), "some words worth keeping", |_, _| {})
        .await
        .unwrap();

    assert_eq!(app.documents().unwrap().len(), 1);
    let removed = app.forget("notes").unwrap().unwrap();
    assert_eq!(removed.source.as_deref(), Some("notes.txt"));
    assert!(app.documents().unwrap().is_empty());
    assert!(app.forget("notes").unwrap().is_none());

    let providers = app.providers();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].info.id, "claude");
    assert_eq!(providers[0].breaker.failure_count, 0);
}

#[tokio::test]
async fn test_empty_document_rejected() {
    let (app, _store) = app_with(&[]);
    assert!(app.ingest_text("blank", None, "  \n ", |_, _| {}).await.is_err());
    assert!(app.documents().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_conversation_removes_messages() {
    let (app, store) = app_with(&[Recorder::answering("claude", "x")]);
    let outcome = app
        .ask("keep me briefly", &AskOptions::default(), None, &CancellationToken::new())
        .await
        .unwrap();
    let id = outcome.conversation.id;

    assert!(app.delete_conversation(&id).await.unwrap());
    assert!(store.messages(&id).await.unwrap().is_empty());
    assert!(app.conversations().await.unwrap().is_empty());
    assert!(!app.delete_conversation(&id).await.unwrap());
}

#[tokio::test]
async fn test_reset_closes_tripped_breaker() {
    let (app, _store) = app_with(&[Recorder::failing("grok")]);
    let token = CancellationToken::new();
    let threshold = app.settings().breaker_config().failure_threshold;

    for _ in 0..threshold {
        app.ask("ping", &AskOptions::default(), None, &token).await.unwrap();
    }
    assert_eq!(app.providers()[0].breaker.state, CircuitState::Open);

    assert!(app.reset_breakers(Some("nope")).is_err());
    app.reset_breakers(Some("grok")).unwrap();
    let breaker = &app.providers()[0].breaker;
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);
}
