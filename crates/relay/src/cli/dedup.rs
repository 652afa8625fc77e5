//! The `relay dedup` command for the idempotent-skip log.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use relay_core::{DedupStore, EnvelopeId, FileDedupStore};

/// Arguments for the `dedup` command.
#[derive(Args, Debug)]
pub struct DedupArgs {
    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: DedupCommand,
}

/// Subcommands for the dedup log.
#[derive(Subcommand, Debug)]
pub enum DedupCommand {
    /// Show the stages an item has completed
    Show {
        /// Envelope id, or the path of an input file as it was enumerated
        target: String,
    },

    /// Rewrite the log with one line per id
    Compact,
}

/// Execute the dedup command.
pub async fn execute(args: DedupArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.config.as_deref())?;
    let store = FileDedupStore::open(config.dedup_path())?;

    match args.command {
        DedupCommand::Show { target } => {
            let id = resolve_id(&target);
            let stages = store.completed_stages(&id)?;
            if stages.is_empty() {
                println!("{id}: no completed stages");
            } else {
                let stages: Vec<&str> = stages.iter().map(String::as_str).collect();
                println!("{id}: {}", stages.join(", "));
            }
        }

        DedupCommand::Compact => {
            let removed = tokio::task::spawn_blocking(move || store.compact()).await??;
            println!(
                "Compacted {}: removed {removed} stale line(s)",
                config.dedup_path().display()
            );
        }
    }

    Ok(())
}

/// Existing files map to their content-signature id; anything else is
/// taken as a literal id.
fn resolve_id(target: &str) -> EnvelopeId {
    let path = Path::new(target);
    if path.is_file() {
        EnvelopeId::for_path(path)
    } else {
        EnvelopeId::new(target)
    }
}
