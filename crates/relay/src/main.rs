//! Relay CLI - concurrent staged image pipeline.
//!
//! Relay reads images from an input directory, pushes each one through a
//! configurable sequence of stages (load, resize, flip, save, ...), retries
//! transient failures, and records permanent ones as dead letters. Re-running
//! a job skips every stage an image already completed.
//!
//! # Usage
//!
//! ```bash
//! # Run the configured job over a directory
//! relay run ./photos -o ./out
//!
//! # Inspect failures
//! relay dlq list
//!
//! # View configuration
//! relay config show
//! ```

use clap::{Parser, Subcommand};

mod cli;
mod logging;

/// Relay - concurrent staged image pipeline with retries and dead letters.
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline over an input directory
    Run(cli::run::RunArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),

    /// Inspect dead-letter records
    Dlq(cli::dlq::DlqArgs),

    /// Inspect and compact the dedup log
    Dedup(cli::dedup::DedupArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so config warnings go through eprintln.
    let config = match relay_core::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `relay config path`."
            );
            relay_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Relay v{}", relay_core::VERSION);

    match cli.command {
        Commands::Run(args) => cli::run::execute(args).await,
        Commands::Config(args) => cli::config::execute(args).await,
        Commands::Dlq(args) => cli::dlq::execute(args).await,
        Commands::Dedup(args) => cli::dedup::execute(args).await,
    }
}
