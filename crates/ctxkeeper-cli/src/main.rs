//! # ctxkeeper-cli
//!
//! Command-line interface for ctxkeeper.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ctxkeeper_core::Config;

mod commands;
mod repl;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
}

/// ctxkeeper - context-window session manager for local models
#[derive(Parser)]
#[command(name = "ctxkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Model to load (overrides config)
    #[arg(short, long)]
    model: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat(ChatArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Snapshot file management
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Show version information
    Version,
}

#[derive(clap::Args)]
pub struct ChatArgs {
    /// Conversation ID used to name snapshot files (defaults to a new UUID)
    #[arg(short, long, value_name = "ID")]
    conversation: Option<String>,

    /// System prompt to prime the window with (overrides config)
    #[arg(short, long)]
    system: Option<String>,

    /// Restore the conversation's snapshot if one exists
    #[arg(short, long)]
    resume: bool,

    /// Maximum tokens generated per reply
    #[arg(long, default_value = "256")]
    max_tokens: usize,
}

impl Default for ChatArgs {
    fn default() -> Self {
        Self {
            conversation: None,
            system: None,
            resume: false,
            max_tokens: 256,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate configuration and report issues
    Validate,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Print the snapshot path for a conversation
    Path {
        /// Conversation ID
        #[arg(short, long)]
        conversation: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load configuration
    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });
    if let Some(model) = cli.model {
        config.model.name = model;
    }

    let ctx = AppContext { config };

    match cli.command {
        Some(Commands::Chat(args)) => {
            repl::run(args, &ctx).await?;
        }
        Some(Commands::Config { action }) => {
            commands::config::handle(action, &ctx)?;
        }
        Some(Commands::Snapshot { action }) => {
            commands::snapshot::handle(action, &ctx)?;
        }
        Some(Commands::Version) => {
            println!("ctxkeeper {}", env!("CARGO_PKG_VERSION"));
        }
        None => {
            // Interactive mode with defaults
            repl::run(ChatArgs::default(), &ctx).await?;
        }
    }

    Ok(())
}
