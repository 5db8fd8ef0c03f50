use std::path::Path;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::app::ProviderStatus;
use crate::config::Settings;
use crate::core::{CircuitState, MetricsSummary, ModelResponse, StreamEvent};
use crate::embeddings::ScoredChunk;
use crate::llm::{CacheStats, Role};
use crate::storage::{Conversation, DocumentRecord, StoredMessage};

pub struct Console;

impl Console {
    pub fn new() -> Self {
        Self
    }

    pub fn banner(&self) {
        let version = env!("CARGO_PKG_VERSION");

        println!(
            r#"
{}
{}
{}
{}
"#,
            "  ┏━╸╻ ╻┏━┓┏━┓╻ ╻┏━┓".bright_cyan(),
            "  ┃  ┣━┫┃ ┃┣┳┛┃ ┃┗━┓".bright_cyan(),
            format!("  ┗━╸╹ ╹┗━┛╹┗╸┗━┛┗━┛  v{}", version).bright_cyan(),
            "  One prompt, every answer".dimmed(),
        );
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", "[INFO]".blue(), message);
    }

    pub fn warn(&self, message: &str) {
        println!("{} {}", "[WARN]".yellow(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "[ERROR]".red(), message);
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", "[OK]".green(), message);
    }

    pub fn user_message(&self, message: &str) {
        println!("\n{} {}", "▶".cyan().bold(), message);
    }

    /// One panel per provider answer
    pub fn response(&self, response: &ModelResponse) {
        let timing = if response.cached {
            "cached".dimmed()
        } else {
            format!("{} ms", response.latency_ms).dimmed()
        };

        match &response.error {
            None => {
                println!(
                    "\n{} {} {}\n{}",
                    format!("[{}]", response.provider).green().bold(),
                    timing,
                    "━".repeat(40).dimmed(),
                    response.content
                );
            }
            Some(error) => {
                println!(
                    "\n{} {} {}\n{}",
                    format!("[{}]", response.provider).red().bold(),
                    timing,
                    "━".repeat(40).dimmed(),
                    error.red()
                );
            }
        }
    }

    pub fn context_used(&self, context: &str) {
        let blocks = context.matches("[Document ").count();
        println!(
            "{} {}",
            "[RAG]".magenta(),
            format!("{} knowledge-base chunk(s) added to the prompt", blocks).dimmed()
        );
    }

    pub fn list_providers(&self, providers: &[ProviderStatus]) {
        println!("\n{}", "PROVIDERS".bold().underline());
        println!("{}", "─".repeat(60));
        if providers.is_empty() {
            println!("  {}", "No providers available. Configure an API key.".yellow());
        }
        for status in providers {
            let state = match status.breaker.state {
                CircuitState::Closed => "CLOSED".green(),
                CircuitState::HalfOpen => "HALF_OPEN".yellow(),
                CircuitState::Open => "OPEN".red(),
            };
            let streaming = if status.info.supports_streaming {
                "streaming".cyan()
            } else {
                "one-shot".dimmed()
            };
            println!(
                "  {} {} {} {}",
                "•".cyan(),
                status.info.id.cyan().bold(),
                format!("{} ({})", status.info.display_name, status.info.model).dimmed(),
                streaming
            );
            println!(
                "    breaker: {} failures: {}",
                state, status.breaker.failure_count
            );
        }
        println!();
    }

    pub fn list_documents(&self, documents: &[DocumentRecord]) {
        println!("\n{}", "KNOWLEDGE BASE".bold().underline());
        println!("{}", "─".repeat(60));
        if documents.is_empty() {
            println!("  {}", "No documents. Add one with `chorus ingest <file>`.".dimmed());
        }
        for document in documents {
            println!(
                "  {} {} {}",
                "•".cyan(),
                document.title.bold(),
                format!("({} chunks, {})", document.chunk_count, ago(document.created_at)).dimmed()
            );
            println!("    {}", document.id.dimmed());
            if let Some(source) = &document.source {
                println!("    {}", source.dimmed());
            }
        }
        println!();
    }

    pub fn search_results(&self, query: &str, results: &[ScoredChunk]) {
        println!("\n{} {}", "SEARCH".bold().underline(), query.cyan());
        if results.is_empty() {
            println!("  {}", "No matches.".dimmed());
            return;
        }
        for (i, result) in results.iter().enumerate() {
            let preview: String = result.chunk.text.chars().take(200).collect();
            println!(
                "\n  {} {} {}",
                format!("{}.", i + 1).cyan(),
                format!("{}#{}", result.chunk.document_id, result.chunk.chunk_index).bold(),
                format!("score {:.3}", result.score).dimmed()
            );
            println!("     {}", preview.replace('\n', " "));
        }
        println!();
    }

    pub fn list_conversations(&self, conversations: &[Conversation]) {
        println!("\n{}", "CONVERSATIONS".bold().underline());
        println!("{}", "─".repeat(60));
        if conversations.is_empty() {
            println!("  {}", "No conversations yet.".dimmed());
        }
        for conversation in conversations {
            println!(
                "  {} {} {}",
                conversation.id.dimmed(),
                conversation.title,
                format!("({})", ago(conversation.created_at)).dimmed()
            );
        }
        println!();
    }

    pub fn history(&self, conversation: &Conversation, messages: &[StoredMessage]) {
        println!("\n{}", conversation.title.bold().underline());
        for message in messages {
            let label = match (message.role, &message.provider) {
                (Role::Assistant, Some(provider)) => format!("[{}]", provider).green().bold(),
                (Role::Assistant, None) => "[ASSISTANT]".green().bold(),
                (Role::User, _) => "[USER]".blue().bold(),
                (Role::System, _) => "[SYSTEM]".yellow().bold(),
            };
            println!("\n{}\n{}", label, message.content);
        }
        println!();
    }

    pub fn cache_stats(&self, stats: &CacheStats) {
        println!("\n{}", "RESPONSE CACHE".bold().underline());
        println!("{}", "─".repeat(60));
        let enabled = if stats.enabled { "yes".green() } else { "no".red() };
        println!("  Enabled: {}", enabled);
        println!("  TTL: {}s", stats.ttl_secs);
        println!("  Entries: {}", stats.total_entries);
        for (provider, count) in &stats.per_provider {
            println!("    {} {}", provider.cyan(), count);
        }
        println!();
    }

    pub fn metrics(&self, summary: &MetricsSummary) {
        println!("{}", summary.to_string().dimmed());
    }

    pub fn show_config(&self, settings: &Settings, path: &Path) {
        println!("\n{}", "CONFIGURATION".bold().underline());
        println!("{}", "─".repeat(60));

        println!("\n  {}", "Providers:".yellow());
        for (id, provider) in &settings.providers {
            let key = if settings.get_api_key(provider).is_some() {
                "key set".green()
            } else {
                "no key".red()
            };
            let enabled = if provider.enabled { "" } else { " (disabled)" };
            println!(
                "    {} {} {}{}",
                id.cyan().bold(),
                format!("{:?} {}", provider.kind, provider.model).dimmed(),
                key,
                enabled.dimmed()
            );
        }

        println!("\n  {}", "Circuit breaker:".yellow());
        println!(
            "    threshold {} | open {}s | call timeout {}s | stream timeout {}s",
            settings.breaker.failure_threshold,
            settings.breaker.open_timeout_secs,
            settings.breaker.call_timeout_secs,
            settings.breaker.stream_timeout_secs
        );

        println!("\n  {}", "Cache:".yellow());
        println!(
            "    {} | {:?} | ttl {}s",
            if settings.cache.enabled { "enabled".green() } else { "disabled".red() },
            settings.cache.backend,
            settings.cache.ttl_secs
        );

        println!("\n  {}", "Knowledge base:".yellow());
        println!(
            "    {:?} embeddings ({}, {} dims) | chunks of {} chars | top {}",
            settings.embedding.provider,
            settings.embedding.model,
            settings.embedding.dimension,
            settings.rag.chunk_chars,
            settings.rag.top_k
        );

        println!(
            "\n  {} {}",
            "Config file:".yellow(),
            path.display().to_string().dimmed()
        );
        if let Ok(database) = settings.database_path() {
            println!(
                "  {} {}",
                "Database:".yellow(),
                database.display().to_string().dimmed()
            );
        }
        println!();
    }

    pub fn ingest_progress(&self) -> ProgressBar {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} chunks")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar
    }

    pub fn confirm(&self, message: &str) -> bool {
        print!("{} {} [y/N]: ", "[CONFIRM]".yellow().bold(), message);
        std::io::Write::flush(&mut std::io::stdout()).ok();

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_ok() {
            let input = input.trim().to_lowercase();
            return input == "y" || input == "yes";
        }
        false
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Prints stream events as they arrive. Chunks from different providers
/// interleave, so a header is printed whenever the speaker changes.
#[derive(Default)]
pub struct StreamPrinter {
    json: bool,
    current: Option<String>,
}

impl StreamPrinter {
    pub fn new(json: bool) -> Self {
        Self { json, current: None }
    }

    pub fn print(&mut self, event: &StreamEvent) {
        if self.json {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
            return;
        }

        match event {
            StreamEvent::ModelStart { provider } => {
                println!("{} {}", "→".dimmed(), format!("{} started", provider).dimmed());
            }
            StreamEvent::ModelChunk { provider, content } => {
                if self.current.as_deref() != Some(provider.as_str()) {
                    print!("\n{} ", format!("[{}]", provider).green().bold());
                    self.current = Some(provider.clone());
                }
                print!("{}", content);
                std::io::Write::flush(&mut std::io::stdout()).ok();
            }
            StreamEvent::ModelComplete { provider, latency_ms } => {
                self.current = None;
                println!(
                    "\n{} {}",
                    "✓".green(),
                    format!("{} done in {} ms", provider, latency_ms).dimmed()
                );
            }
            StreamEvent::ModelError { provider, error, .. } => {
                self.current = None;
                println!("\n{} {}", format!("✗ [{}]", provider).red().bold(), error.red());
            }
            StreamEvent::AllComplete => {
                println!();
            }
        }
    }
}

/// Coarse "time ago" for unix-second timestamps
fn ago(timestamp: i64) -> String {
    let elapsed = crate::storage::unix_now().saturating_sub(timestamp).max(0);
    match elapsed {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", elapsed / 60),
        3600..=86_399 => format!("{}h ago", elapsed / 3600),
        _ => format!("{}d ago", elapsed / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ago_buckets() {
        let now = crate::storage::unix_now();
        assert_eq!(ago(now), "just now");
        assert_eq!(ago(now - 120), "2m ago");
        assert_eq!(ago(now - 7200), "2h ago");
        assert_eq!(ago(now - 3 * 86_400), "3d ago");
    }

    #[test]
    fn test_future_timestamp_is_just_now() {
        assert_eq!(ago(crate::storage::unix_now() + 1000), "just now");
    }
}
