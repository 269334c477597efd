//! eddy - line-oriented client for multi-agent conversations

mod commands;
mod config;
mod ui;

use anyhow::Context;
use clap::Parser;
use commands::CommandResult;
use eddy_chat::{ChatSession, ChatUpdate, RegistryCache, SseTransport};
use eddy_wire::{AgentProfile, ApiClient};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// eddy - join a conversation with streaming agents
#[derive(Parser, Debug)]
#[command(name = "eddy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Conversation to join
    #[arg(short, long)]
    conversation: Option<String>,

    /// Conversation server base URL
    #[arg(short, long)]
    server_url: Option<String>,

    /// Model the conversation runs on (default: gpt-4o)
    #[arg(short, long)]
    model: Option<String>,

    /// Print every update as a JSON line instead of text
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they never interleave with conversation output
    let default_filter = if args.verbose {
        "eddy=debug,eddy_chat=debug,eddy_wire=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    let conversation = args
        .conversation
        .context("No conversation given; pass --conversation <id>")?;
    let server_url = args
        .server_url
        .or(cfg.server_url.clone())
        .context("No server URL; pass --server-url or set server_url in the config file")?;
    let model_id = args
        .model
        .or(cfg.model.clone())
        .unwrap_or_else(|| "gpt-4o".to_string());

    let mut client = ApiClient::new(server_url)?;
    if let Some(token) = cfg.api_token() {
        client = client.with_token(token);
    }

    let profiles = RegistryCache::<AgentProfile>::new(Arc::new(client.clone()));
    let printer = ui::Printer::default().with_profiles(profiles);

    let session = ChatSession::new(
        cfg.session_config(&conversation, &model_id),
        Arc::new(SseTransport::new(client.clone())),
        Arc::new(client.clone()),
        Arc::new(client),
    );

    run_interactive(session, printer, args.json).await
}

async fn run_interactive(
    mut session: ChatSession,
    mut printer: ui::Printer,
    json: bool,
) -> anyhow::Result<()> {
    let mut updates = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!(
            "eddy ({}) conversation: {}  /help for commands",
            session.config().model_id,
            session.config().conversation_id
        );
        eprintln!();
    }

    session.connect();
    session.load_older();

    loop {
        tokio::select! {
            _ = session.pump() => {}

            update = updates.recv() => match update {
                Ok(update) => print_update(&mut printer, &update, &session, json)?,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Display fell behind, skipped {} updates", n);
                }
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_input(&mut session, &line).await {
                        break;
                    }
                }
                // EOF
                None => break,
            },
        }
    }

    session.close().await;
    Ok(())
}

fn print_update(
    printer: &mut ui::Printer,
    update: &ChatUpdate,
    session: &ChatSession,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(update)?);
        return Ok(());
    }
    for line in printer.render(update, session.store()) {
        println!("{}", line);
    }
    Ok(())
}

/// Returns `false` when the user asked to exit
async fn handle_input(session: &mut ChatSession, input: &str) -> bool {
    let input = input.trim();
    if input.is_empty() {
        return true;
    }

    let result = match commands::execute_command(input, session) {
        None => session.send(input).await.map(|_| ()),
        Some(CommandResult::Exit) => return false,
        Some(CommandResult::Message(text)) => {
            println!("{}", text);
            Ok(())
        }
        Some(CommandResult::Unknown(command)) => {
            println!("Unknown command: /{} (try /help)", command);
            Ok(())
        }
        Some(CommandResult::LoadOlder) => {
            if !session.load_older() {
                let reason = if session.pager().is_loading() {
                    "Already loading"
                } else {
                    "No older messages"
                };
                println!("{}", reason);
            }
            Ok(())
        }
        Some(CommandResult::Abort) => {
            session.abort();
            Ok(())
        }
        Some(CommandResult::Rollback(id)) => session.rollback_to(&id).await,
        Some(CommandResult::Edit { message_id, text }) => {
            session.edit(&message_id, &text).await.map(|_| ())
        }
        Some(CommandResult::Retry(id)) => session.retry(&id).await.map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }
    true
}
