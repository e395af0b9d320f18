mod config;
mod events;
mod ollama;
mod session;
mod storage;
mod store;
mod stream;
#[cfg(test)]
mod testutil;

use std::io::Write;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::ChatEvent;
use crate::session::ChatSession;
use crate::store::Role;

#[derive(Parser)]
#[command(name = "fennec")]
#[command(version)]
#[command(about = "Chat with a local Ollama server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt to the active conversation and stream the reply
    Ask {
        /// The prompt text
        prompt: Vec<String>,
        /// Start a fresh conversation instead of using the active one
        #[arg(long)]
        new: bool,
    },
    /// List saved conversations
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Ask { prompt, new } => ask(config, prompt.join(" "), new).await,
        Commands::List => list(config),
    }
}

async fn ask(config: Config, prompt: String, new: bool) -> Result<()> {
    let mut session = ChatSession::load(config)?;
    let mut events = session.take_events();

    let index = if new {
        session.create_new()
    } else {
        match session.active_index() {
            Some(index) => index,
            None => session.create_new(),
        }
    };

    let session_id = session.send(&prompt, index)?;

    // The reply arrives as cumulative text; print only what's new.
    let mut printed = 0;
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::StreamDelta { session_id: id, text } if id == session_id => {
                print!("{}", &text[printed..]);
                std::io::stdout().flush()?;
                printed = text.len();
            }
            ChatEvent::Completed { session_id: id } if id == session_id => {
                println!();
                break;
            }
            ChatEvent::Failed { session_id: id, error } if id == session_id => {
                println!();
                eprintln!("request failed: {error}");
                break;
            }
            ChatEvent::SaveFailed { error } => {
                eprintln!("warning: could not save conversations: {error}");
            }
            _ => {}
        }
    }

    session.shutdown().await;
    Ok(())
}

fn list(config: Config) -> Result<()> {
    let session = ChatSession::load(config)?;
    let conversations = session.conversations();

    if conversations.iter().all(|c| c.messages.is_empty()) {
        println!("No conversations yet. Start one with: fennec ask <prompt>");
        return Ok(());
    }

    for (index, conversation) in conversations.iter().enumerate() {
        let title = conversation
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
            .unwrap_or("(empty)");
        let title: String = title.chars().take(60).collect();
        println!("{index}: {title} ({} messages)", conversation.messages.len());
    }
    Ok(())
}
