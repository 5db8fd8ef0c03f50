mod repl;

pub use repl::run_repl;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chorus")]
#[command(author = "Chorus Team")]
#[command(version)]
#[command(about = "Ask many AI models at once - one prompt, every answer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: per-user config.toml)
    #[arg(long, global = true, env = "CHORUS_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a prompt to several providers in parallel
    Ask {
        /// The prompt to send
        #[arg(required = true)]
        prompt: String,

        /// Provider to ask (repeatable; default: all healthy providers)
        #[arg(short, long = "provider")]
        providers: Vec<String>,

        /// Add context from the knowledge base
        #[arg(long)]
        rag: bool,

        /// Number of knowledge-base chunks to include
        #[arg(long)]
        top_k: Option<usize>,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Print answers as they arrive
        #[arg(short, long)]
        stream: bool,

        /// Emit JSON instead of formatted panels
        #[arg(long)]
        json: bool,
    },

    /// Add a text file to the knowledge base
    Ingest {
        /// Path to a UTF-8 text file
        #[arg(required = true)]
        file: PathBuf,

        /// Document title (default: file name)
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Semantic search over the knowledge base
    Search {
        /// Search query
        #[arg(required = true)]
        query: String,

        /// Number of results to return
        #[arg(short = 'n', long, default_value = "5")]
        top_k: usize,
    },

    /// List knowledge-base documents
    Documents,

    /// Remove a document and its chunks from the knowledge base
    Forget {
        /// Document id or title
        document: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the messages of a conversation
    History {
        /// Conversation id
        conversation: String,
    },

    /// List conversations, or manage one
    Conversations {
        #[command(subcommand)]
        command: Option<ConversationCommands>,
    },

    /// Show providers and their circuit breaker state
    Providers,

    /// Response cache commands
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum ConversationCommands {
    /// Delete a conversation and its messages
    Delete {
        /// Conversation id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cache statistics
    Stats,

    /// Remove cached responses
    Clear {
        /// Key glob, e.g. "chat_response:claude:*" (default: everything)
        pattern: Option<String>,
    },
}

/// Token cancelled by the next Ctrl-C, and the task that watches for it.
pub fn interrupt_token() -> (tokio_util::sync::CancellationToken, tokio::task::JoinHandle<()>) {
    let token = tokio_util::sync::CancellationToken::new();
    let watcher = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling in-flight requests");
                token.cancel();
            }
        })
    };
    (token, watcher)
}
