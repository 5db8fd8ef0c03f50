use std::io::{self, Write};

use anyhow::Result;
use colored::Colorize;
use tokio::sync::mpsc;

use super::interrupt_token;
use crate::app::{App, AskOptions};
use crate::core::StreamEvent;
use crate::ui::{Console, StreamPrinter};

/// Interactive mode: every prompt continues one conversation.
pub async fn run_repl(app: &App, console: &Console, stream: bool) -> Result<()> {
    console.info("Starting interactive mode. Type 'help' for commands, 'exit' to quit.\n");

    let mut options = AskOptions::default();
    let mut stream = stream;

    loop {
        print!("\n{} ", "▶".cyan().bold());
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input.to_lowercase().as_str() {
            "exit" | "quit" | "q" => {
                console.info("Goodbye!");
                break;
            }
            "new" | "clear" => {
                options.conversation = None;
                console.info("Started a new conversation.");
                continue;
            }
            "rag" => {
                options.rag = !options.rag;
                console.info(&format!("Knowledge-base context {}.", on_off(options.rag)));
                continue;
            }
            "stream" => {
                stream = !stream;
                console.info(&format!("Streaming {}.", on_off(stream)));
                continue;
            }
            "providers" => {
                console.list_providers(&app.providers());
                continue;
            }
            "metrics" => {
                console.metrics(&app.metrics().summary());
                continue;
            }
            "help" | "?" => {
                print_help();
                continue;
            }
            _ => {}
        }

        if input == "reset" || input.starts_with("reset ") {
            let target = input["reset".len()..].trim();
            let provider = (!target.is_empty() && target != "all").then_some(target);
            match app.reset_breakers(provider) {
                Ok(()) => console.success(&format!(
                    "Circuit breaker reset: {}",
                    provider.unwrap_or("all providers")
                )),
                Err(e) => console.error(&format!("{:#}", e)),
            }
            continue;
        }

        if let Some(rest) = input.strip_prefix("use ") {
            options.providers = rest
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
            if options.providers.iter().any(|id| id == "all") {
                options.providers.clear();
            }
            console.info(&format!(
                "Asking: {}",
                if options.providers.is_empty() {
                    "all healthy providers".to_string()
                } else {
                    options.providers.join(", ")
                }
            ));
            continue;
        }

        let (cancel, watcher) = interrupt_token();
        let result = if stream {
            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let printer = tokio::spawn(async move {
                let mut printer = StreamPrinter::new(false);
                while let Some(event) = rx.recv().await {
                    printer.print(&event);
                }
            });
            let result = app.ask(input, &options, Some(tx), &cancel).await;
            printer.await.ok();
            result
        } else {
            app.ask(input, &options, None, &cancel).await
        };
        watcher.abort();

        match result {
            Ok(outcome) => {
                if let Some(context) = &outcome.context {
                    console.context_used(context);
                }
                if !stream {
                    for response in &outcome.responses {
                        console.response(response);
                    }
                }
                options.conversation = Some(outcome.conversation.id);
            }
            Err(e) => console.error(&format!("{:#}", e)),
        }
    }

    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn print_help() {
    println!("\n{}", "Commands:".bold().underline());
    println!("  {}  ask only these providers (`use all` to reset)", "use <id,...>".cyan());
    println!("  {}           toggle knowledge-base context", "rag".cyan());
    println!("  {}        toggle streaming output", "stream".cyan());
    println!("  {}     show providers and breaker state", "providers".cyan());
    println!("  {}    close a provider's breaker (default: all)", "reset [id]".cyan());
    println!("  {}       show request metrics", "metrics".cyan());
    println!("  {}           start a new conversation", "new".cyan());
    println!("  {}          leave", "exit".cyan());
}
