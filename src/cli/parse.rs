//! CLI parse: clap types for docforge. No behavior; definitions only.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// docforge - quality-gated document generation with versioned storage
#[derive(Parser, Debug)]
#[command(name = "docforge")]
#[command(about = "Generate, critique, store and version structured documents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides layered config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the request(s) in a JSON file: one request object or an array
    Run {
        request: PathBuf,
        /// Concurrent executions for an array of requests
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Print the current document for a natural key (owner/kind/order)
    Load {
        natural_key: String,
    },
    /// List every stored version of a natural key
    History {
        natural_key: String,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Replay interrupted replacements and delete unreferenced blobs
    Reconcile {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Run { .. } => "run",
            Commands::Load { .. } => "load",
            Commands::History { .. } => "history",
            Commands::Reconcile { .. } => "reconcile",
        }
    }
}
