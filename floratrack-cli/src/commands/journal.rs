use clap::{Args, Subcommand};
use floratrack_core::{MutationRecord, MutationStatus};

use super::OutputFormat;
use crate::config::Config;
use crate::sync::open_store;

/// Inspect and manage queued changes
#[derive(Args)]
pub struct JournalCommand {
    #[command(subcommand)]
    pub command: JournalSubcommand,
}

#[derive(Subcommand)]
pub enum JournalSubcommand {
    /// List queued changes, oldest first
    List {
        /// Only show failed changes
        #[arg(long)]
        failed: bool,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Queue failed changes for another attempt
    Retry {
        /// Operation ID of a failed change
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        op_id: Option<String>,

        /// Retry every failed change
        #[arg(long)]
        all: bool,
    },

    /// Drop a failed change and restore the last synced state
    Discard {
        /// Operation ID of a failed change
        op_id: String,
    },
}

impl JournalSubcommand {
    pub fn is_write(&self) -> bool {
        matches!(self, JournalSubcommand::Retry { .. })
    }
}

impl JournalCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            JournalSubcommand::List { failed, format } => {
                let (_, store) = open_store(config)?;
                let records: Vec<&MutationRecord> = store
                    .journal()
                    .iter()
                    .filter(|r| !*failed || r.status == MutationStatus::Failed)
                    .collect();

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No queued changes.");
                            return Ok(());
                        }
                        for record in &records {
                            println!("{}", format_record(record));
                        }
                    }
                }
                Ok(())
            }

            JournalSubcommand::Retry { op_id, all } => {
                let (file, mut store) = open_store(config)?;
                if *all {
                    let count = store.retry_all_failed();
                    file.save(&store)?;
                    println!("Queued {} failed change(s) for retry.", count);
                } else if let Some(op_id) = op_id {
                    store.retry_failed(op_id)?;
                    file.save(&store)?;
                    println!("Queued {} for retry.", op_id);
                }
                Ok(())
            }

            JournalSubcommand::Discard { op_id } => {
                let (file, mut store) = open_store(config)?;
                let record = store.discard_failed(op_id)?;
                file.save(&store)?;
                println!(
                    "Discarded {} of {} {}.",
                    record.operation, record.entity_type, record.entity_id
                );
                Ok(())
            }
        }
    }
}

fn format_record(record: &MutationRecord) -> String {
    let mut line = format!(
        "{}  {:<9} {:<6} {} {}  {}",
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.status.to_string(),
        record.operation.to_string(),
        record.entity_type,
        record.entity_id,
        record.op_id
    );
    if record.retry_count > 0 {
        line.push_str(&format!("  (attempts: {})", record.retry_count));
    }
    if let Some(failure) = &record.failure {
        line.push_str(&format!("\n    {}", failure));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use floratrack_core::{EntityType, ErrorKind, Fields, Operation, SyncFailure};

    #[test]
    fn test_format_record_shows_failure() {
        let mut record = MutationRecord::new(
            EntityType::Task,
            "task-3",
            Operation::Update,
            Fields::new(),
            2,
        );
        record.status = MutationStatus::Failed;
        record.retry_count = 5;
        record.failure = Some(SyncFailure {
            kind: ErrorKind::Transient,
            message: "connection refused".to_string(),
        });

        let line = format_record(&record);
        assert!(line.contains("failed"));
        assert!(line.contains("task task-3"));
        assert!(line.contains("(attempts: 5)"));
        assert!(line.contains("[transient] connection refused"));
    }
}
