//! weft - inspect and manage stored conversations

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use uuid::Uuid;
use weft_agent::config::EXAMPLE_CONFIG;
use weft_agent::{ConversationState, EngineConfig, JsonlStore, LogStore};

/// weft - conversation log tooling
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: $WEFT_CONFIG_PATH or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored conversations
    List,
    /// Show the derived state of a conversation
    Inspect { id: Uuid },
    /// Print a conversation's events as JSON lines
    Events {
        id: Uuid,
        /// First sequence number to print
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Delete a conversation's log
    Delete { id: Uuid },
    /// Validate a config file
    CheckConfig {
        path: Option<PathBuf>,
        /// Print an annotated example config instead
        #[arg(long)]
        example: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("weft=debug")
            .init();
    }

    match args.command {
        Command::CheckConfig { path, example } => {
            if example {
                print!("{}", EXAMPLE_CONFIG);
                return Ok(());
            }
            check_config(path.or(args.config))
        }
        command => {
            let config = load_config(args.config.as_ref())?;
            let store = JsonlStore::new(config.store.dir())
                .context("Failed to open conversation store")?;
            match command {
                Command::List => list(&store),
                Command::Inspect { id } => inspect(&store, id),
                Command::Events { id, since } => events(&store, id, since),
                Command::Delete { id } => {
                    store.delete(id)?;
                    println!("Deleted {}", id);
                    Ok(())
                }
                Command::CheckConfig { .. } => Ok(()),
            }
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };
    tracing::debug!(store = %config.store.dir().display(), "Loaded config");
    Ok(config)
}

fn check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(EngineConfig::config_path);
    if !path.exists() {
        println!("{} does not exist; defaults apply", path.display());
        return Ok(());
    }
    let config = EngineConfig::load(&path)?;
    println!("{} is valid", path.display());
    println!(
        "  store: {}\n  confirmation: {:?}\n  condenser: max {} events (keep first {}, last {})\n  webhooks: {}",
        config.store.dir().display(),
        config.confirmation.policy,
        config.condenser.max_events,
        config.condenser.keep_first,
        config.condenser.keep_last,
        config.notifier.webhooks.len()
    );
    Ok(())
}

fn list(store: &JsonlStore) -> anyhow::Result<()> {
    let ids = store.list()?;
    if ids.is_empty() {
        println!("No stored conversations found.");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<26} EVENTS", "ID", "CREATED", "STATUS");
    for id in ids {
        match store.snapshot(id) {
            Ok(stored) => {
                let state = ConversationState::fold(&stored.events);
                println!(
                    "{:<38} {:<20} {:<26} {}",
                    id,
                    stored.meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                    state.status.to_string(),
                    stored.events.len()
                );
            }
            Err(e) => println!("{:<38} unreadable: {}", id, e),
        }
    }
    Ok(())
}

fn inspect(store: &JsonlStore, id: Uuid) -> anyhow::Result<()> {
    let stored = store.snapshot(id)?;
    let state = ConversationState::fold(&stored.events);

    println!("Conversation {}", id);
    println!("  created: {}", stored.meta.created_at.to_rfc3339());
    println!("  events:  {}", stored.events.len());
    println!("  status:  {}", state.status);
    if let Some(reason) = &state.terminal_reason {
        println!("  reason:  {}", reason);
    }
    if let Some(pending) = &state.pending {
        println!(
            "  pending: {} {} (seq {}, risk {}, {})",
            pending.call.name,
            pending.call.arguments,
            pending.seq,
            pending.risk,
            if pending.awaiting_decision() {
                "awaiting confirmation"
            } else {
                "approved"
            }
        );
    }
    if !state.planned.is_empty() {
        let planned: Vec<&str> = state.planned.iter().map(|c| c.name.as_str()).collect();
        println!("  planned: {}", planned.join(", "));
    }
    println!(
        "  config:  {}",
        serde_json::to_string(&stored.meta.config)?
    );
    Ok(())
}

fn events(store: &JsonlStore, id: Uuid, since: u64) -> anyhow::Result<()> {
    let stored = store.snapshot(id)?;
    for event in stored.events.iter().filter(|e| e.seq >= since) {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}
