//! askdb binary - composition root.
//!
//! 1. Parse flags and load configuration from TOML
//! 2. Open the session store (SQLite, in-memory fallback) and purge stale sessions
//! 3. Open the target SQLite database read-only
//! 4. Run the interactive loop until `:quit` or end of input

mod cli;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use askdb_core::config::{expand_home, AskConfig};
use askdb_core::types::SessionId;
use askdb_query::{ContextAwareQueryProcessor, SqliteConnector};
use askdb_storage::{InMemorySessionStore, SessionStore, SqliteSessionStore};

use crate::cli::CliArgs;

/// A line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    New,
    History,
    Sessions,
    Clear,
    Last,
    Help,
    Quit,
    Unknown(&'a str),
    Ask(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(cmd) = line.strip_prefix(':') else {
            return Some(Command::Ask(line));
        };
        Some(match cmd.trim().to_ascii_lowercase().as_str() {
            "new" => Command::New,
            "history" => Command::History,
            "sessions" => Command::Sessions,
            "clear" => Command::Clear,
            "last" => Command::Last,
            "help" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            _ => Command::Unknown(line),
        })
    }
}

const COMMANDS_HELP: &str = "Commands: :new  :history  :sessions  :clear  :last  :help  :quit\n\
Anything else is a question about the database.";

fn open_session_store(config: &AskConfig, ephemeral: bool) -> Arc<dyn SessionStore> {
    if ephemeral {
        return Arc::new(InMemorySessionStore::new());
    }
    let path = config.sessions_path();
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "Failed to create data directory");
        }
    }
    match SqliteSessionStore::open(&path) {
        Ok(store) => {
            tracing::info!(path = %path.display(), "Session store opened");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Session store unavailable, sessions will not persist"
            );
            Arc::new(InMemorySessionStore::new())
        }
    }
}

async fn print(out: &mut tokio::io::Stdout, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    if !text.ends_with('\n') {
        out.write_all(b"\n").await?;
    }
    out.flush().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = AskConfig::load_or_default(&config_file);
    args.apply(&mut config);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting askdb v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    if config.database.path.is_empty() {
        return Err(format!(
            "no database given; pass --database or set {}",
            cli::DATABASE_ENV
        )
        .into());
    }
    if !config.database.family.eq_ignore_ascii_case("sqlite") {
        tracing::warn!(
            family = %config.database.family,
            "Only SQLite databases can be opened from the command line"
        );
    }

    let db_path: PathBuf = expand_home(&config.database.path);
    let connector = SqliteConnector::open(&db_path)?;
    tracing::info!(path = %db_path.display(), "Database opened read-only");

    let store = open_session_store(&config, args.ephemeral);
    let processor = ContextAwareQueryProcessor::new(store, Arc::new(connector), &config);

    if let Err(e) = processor.purge_inactive(config.storage.retention_days) {
        tracing::warn!(error = %e, "Session purge failed");
    }
    processor.test_connection().await?;

    let mut session_id: SessionId = match args.session {
        Some(id) => id,
        None => processor.new_session()?,
    };
    tracing::info!(session_id = %session_id, "Session ready");

    let mut out = tokio::io::stdout();
    print(&mut out, &format!("askdb: connected to {}", db_path.display())).await?;
    print(&mut out, COMMANDS_HELP).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        out.write_all(b"askdb> ").await?;
        out.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        match command {
            Command::Quit => break,
            Command::Help => print(&mut out, COMMANDS_HELP).await?,
            Command::Unknown(cmd) => {
                print(&mut out, &format!("Unknown command {cmd}. {COMMANDS_HELP}")).await?
            }
            Command::New => {
                session_id = processor.new_session()?;
                print(&mut out, &format!("New session {session_id}")).await?;
            }
            Command::History => {
                let turns = processor.history(session_id)?;
                print(&mut out, &render::render_history(&turns)).await?;
            }
            Command::Sessions => {
                let sessions = processor.list_sessions()?;
                print(&mut out, &render::render_sessions(&sessions, session_id)).await?;
            }
            Command::Clear => {
                processor.clear_session(session_id)?;
                print(&mut out, "Session history cleared.").await?;
            }
            Command::Last => {
                let text = processor
                    .last_interaction_summary(session_id)?
                    .unwrap_or_else(|| "No turns yet.".to_string());
                print(&mut out, &text).await?;
            }
            Command::Ask(question) => match processor.process(session_id, question).await {
                Ok(outcome) if args.json => {
                    print(&mut out, &serde_json::to_string_pretty(&outcome)?).await?
                }
                Ok(outcome) => print(&mut out, &render::render_outcome(&outcome)).await?,
                Err(e) => {
                    tracing::debug!(error = ?e, "Question failed");
                    print(&mut out, &format!("error: {}", e.user_message())).await?;
                }
            },
        }
    }

    tracing::info!(session_id = %session_id, "Goodbye");
    Ok(())
}
