//! # docchat CLI
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat index build` | Load the index, building it if needed |
//! | `docchat index rebuild` | Rebuild the index from the corpus |
//! | `docchat index status` | Show the snapshot on disk |
//! | `docchat ask "<question>"` | Answer one question |
//! | `docchat chat` | Interactive conversation |
//! | `docchat serve` | Start the HTTP API |
//!
//! Logs go to stderr (`RUST_LOG`, default `docchat=info`); answers go to
//! stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docchat::config::{self, DEFAULT_CONFIG_PATH};
use docchat::{ask, index_cmd, server};

/// docchat: question answering over a document directory.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "docchat: question answering over a directory of documents",
    version,
    long_about = "docchat indexes a directory of Markdown, text, PDF and DOCX files, \
    retrieves the passages most relevant to a question, and has a language model \
    answer from them. Use it one-shot (ask), interactively (chat) or over HTTP (serve)."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// If the default path does not exist, built-in defaults are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the persisted index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Answer a single question.
    ///
    /// Prints the answer as it is generated, then the best-matching source.
    Ask {
        /// The question.
        question: String,

        /// Wait for the complete answer instead of streaming it.
        #[arg(long)]
        no_stream: bool,
    },

    /// Start an interactive conversation.
    ///
    /// Earlier turns are sent along as context. `/clear` resets the
    /// conversation, `/exit` quits.
    Chat,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Load the index, building and persisting it if it is missing or unusable.
    Build,
    /// Discard any snapshot and rebuild from the corpus.
    Rebuild,
    /// Show the snapshot metadata without loading vectors.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "docchat=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config_or_default(&cli.config)?;

    match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Build => index_cmd::run_index_build(&cfg).await?,
            IndexAction::Rebuild => index_cmd::run_index_rebuild(&cfg).await?,
            IndexAction::Status => index_cmd::run_index_status(&cfg)?,
        },
        Commands::Ask {
            question,
            no_stream,
        } => {
            ask::run_ask(&cfg, &question, no_stream).await?;
        }
        Commands::Chat => {
            ask::run_chat(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
