use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus::app::{App, AskOptions};
use chorus::cli::{self, interrupt_token, CacheCommands, Cli, Commands, ConversationCommands};
use chorus::config::Settings;
use chorus::ui::{Console, StreamPrinter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let console = Console::new();
    let settings = Settings::load(cli.config.as_deref())?;

    let Some(command) = cli.command else {
        console.banner();
        let app = App::new(settings)?;
        return cli::run_repl(&app, &console, false).await;
    };

    if let Commands::Config = command {
        let path = Settings::resolve_path(cli.config.as_deref())?;
        console.show_config(&settings, &path);
        return Ok(());
    }

    let app = App::new(settings)?;

    match command {
        Commands::Ask {
            prompt,
            providers,
            rag,
            top_k,
            conversation,
            stream,
            json,
        } => {
            let options = AskOptions {
                providers,
                rag,
                top_k,
                conversation,
            };
            let (cancel, watcher) = interrupt_token();

            let outcome = if stream {
                let (tx, rx) = mpsc::channel(64);
                let printer = tokio::spawn(async move {
                    let mut printer = StreamPrinter::new(json);
                    let mut events = ReceiverStream::new(rx);
                    while let Some(event) = events.next().await {
                        printer.print(&event);
                    }
                });
                let outcome = app.ask(&prompt, &options, Some(tx), &cancel).await;
                printer.await.ok();
                outcome?
            } else {
                app.ask(&prompt, &options, None, &cancel).await?
            };
            watcher.abort();

            if json {
                if !stream {
                    println!("{}", serde_json::to_string_pretty(&outcome.responses)?);
                }
            } else {
                if let Some(context) = &outcome.context {
                    console.context_used(context);
                }
                if !stream {
                    for response in &outcome.responses {
                        console.response(response);
                    }
                }
                console.info(&format!("Conversation: {}", outcome.conversation.id));
            }
        }
        Commands::Ingest { file, title } => {
            let bar = console.ingest_progress();
            let progress = {
                let bar = bar.clone();
                move |done: usize, total: usize| {
                    bar.set_length(total as u64);
                    bar.set_position(done as u64);
                }
            };
            let result = app.ingest(&file, title.as_deref(), progress).await;
            bar.finish_and_clear();

            let document = result?;
            console.success(&format!(
                "Ingested '{}' ({} chunks) as {}",
                document.title, document.chunk_count, document.id
            ));
        }
        Commands::Search { query, top_k } => {
            let results = app.search(&query, top_k).await?;
            console.search_results(&query, &results);
        }
        Commands::Documents => {
            console.list_documents(&app.documents()?);
        }
        Commands::Forget { document, yes } => {
            if !yes && !console.confirm(&format!("Delete document '{}' and its chunks?", document)) {
                console.info("Cancelled.");
                return Ok(());
            }
            match app.forget(&document)? {
                Some(removed) => console.success(&format!("Removed '{}'", removed.title)),
                None => console.warn(&format!("No document matches '{}'", document)),
            }
        }
        Commands::History { conversation } => {
            let (conversation, messages) = app.history(&conversation).await?;
            console.history(&conversation, &messages);
        }
        Commands::Conversations { command: None } => {
            console.list_conversations(&app.conversations().await?);
        }
        Commands::Conversations {
            command: Some(ConversationCommands::Delete { id }),
        } => {
            if app.delete_conversation(&id).await? {
                console.success(&format!("Deleted conversation {}", id));
            } else {
                anyhow::bail!("Conversation not found: {}", id);
            }
        }
        Commands::Providers => {
            console.list_providers(&app.providers());
        }
        Commands::Cache { command } => match command {
            CacheCommands::Stats => {
                console.cache_stats(&app.cache_stats().await);
            }
            CacheCommands::Clear { pattern } => {
                let removed = app.clear_cache(pattern.as_deref()).await;
                console.success(&format!("Removed {} cached response(s)", removed));
            }
        },
        Commands::Config => {}
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "chorus=debug" } else { "chorus=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
