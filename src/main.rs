//! # QA Harness CLI (`qa`)
//!
//! Answers questions about a fixed reference text, grounded in passages
//! retrieved from a precomputed semantic index.
//!
//! ## Usage
//!
//! ```bash
//! qa --config ./config/qa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qa ask "<question>"` | Answer one question, streaming the text |
//! | `qa chat` | Interactive session with conversation switching |
//! | `qa serve` | Start the HTTP server |
//! | `qa index` | Describe the configured semantic index |
//!
//! ## Examples
//!
//! ```bash
//! qa ask "What is emotivity?"
//! qa ask "Define emotivity" --json
//! qa --profile prod serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use qa_harness::config::{self, Config};
use qa_harness::engine::QaEngine;
use qa_harness::{ask, chat, index, logging, server};
use qa_harness_core::store::memory::InMemoryConversationStore;

/// Retrieval-augmented question answering with streamed answers and
/// per-conversation memory.
#[derive(Parser)]
#[command(name = "qa", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qa.toml")]
    config: PathBuf,

    /// Profile table to merge over the base configuration.
    #[arg(long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question in a fresh conversation.
    Ask {
        question: String,

        /// Print the final answer as JSON instead of streaming text.
        #[arg(long)]
        json: bool,
    },

    /// Interactive chat session.
    Chat,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Describe the semantic index file.
    Index,
}

fn build_engine(cfg: &Config) -> anyhow::Result<QaEngine> {
    let handle = index::load_index(&cfg.index.path);
    QaEngine::from_config(cfg, handle, Arc::new(InMemoryConversationStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config, cli.profile.as_deref())?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Ask { question, json } => {
            let engine = build_engine(&cfg)?;
            ask::run_ask(&engine, &question, json).await?;
        }
        Commands::Chat => {
            let engine = build_engine(&cfg)?;
            chat::run_chat(&engine).await?;
        }
        Commands::Serve => {
            let engine = build_engine(&cfg)?;
            server::run_server(&cfg, engine).await?;
        }
        Commands::Index => {
            index::run_index_info(&cfg)?;
        }
    }

    Ok(())
}
