//! docforge CLI Binary
//!
//! Command-line interface for the docforge generation pipeline.

use anyhow::Context;
use clap::Parser;
use docforge::cli::{Cli, RunContext};
use docforge::config::ConfigLoader;
use docforge::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    match run(&cli) {
        Ok(output) => {
            info!(command = cli.command.name(), "Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!(command = cli.command.name(), error = %e, "Command failed");
            eprintln!("{:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<String> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())
        .map_err(|e| anyhow::anyhow!(docforge::cli::map_error(&e)))
        .context("Error initializing workspace")?;
    runtime
        .block_on(context.execute(&cli.command))
        .map_err(|e| anyhow::anyhow!(docforge::cli::map_error(&e)))
        .with_context(|| format!("docforge {} failed", cli.command.name()))
}

/// Build logging configuration from CLI args and config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = match cli.config {
        Some(ref config_path) => ConfigLoader::load_from_file(config_path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default(),
        None => ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default(),
    };

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    config
}
