//! The `relay dlq` command for inspecting dead-letter records.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use relay_core::{DeadLetterRecord, DirectoryDeadLetterSink};
use uuid::Uuid;

/// Arguments for the `dlq` command.
#[derive(Args, Debug)]
pub struct DlqArgs {
    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: DlqCommand,
}

/// Subcommands for dead-letter inspection.
#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List records, oldest first
    List {
        /// Only show records from this stage
        #[arg(long)]
        stage: Option<String>,
    },

    /// Print one record as JSON
    Show {
        /// Record id as printed by `relay dlq list`
        record_id: Uuid,
    },
}

/// Execute the dlq command.
pub async fn execute(args: DlqArgs) -> anyhow::Result<()> {
    let config = super::load_config(args.config.as_deref())?;
    let dir = config.dead_letter_dir();
    if !dir.exists() {
        println!("No dead letters at {}", dir.display());
        return Ok(());
    }
    let sink = DirectoryDeadLetterSink::new(&dir)?;

    match args.command {
        DlqCommand::List { stage } => {
            let records = filter_by_stage(sink.list()?, stage.as_deref());
            if records.is_empty() {
                println!("No dead letters at {}", dir.display());
            }
            for record in &records {
                println!("{}", list_line(record));
            }
        }

        DlqCommand::Show { record_id } => {
            let record = sink.find(record_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn filter_by_stage(records: Vec<DeadLetterRecord>, stage: Option<&str>) -> Vec<DeadLetterRecord> {
    match stage {
        Some(stage) => records.into_iter().filter(|r| r.stage == stage).collect(),
        None => records,
    }
}

fn list_line(record: &DeadLetterRecord) -> String {
    format!(
        "{}  {}  {:<16} {:<24} {}",
        record.record_id,
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.stage,
        record.meta.file_name().unwrap_or_else(|| record.envelope_id.short(12)),
        record.error
    )
}
