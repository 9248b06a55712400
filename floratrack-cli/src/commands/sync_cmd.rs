//! Sync CLI commands for synchronizing with the server.

use chrono::Utc;
use clap::{Args, Subcommand};
use floratrack_core::status::describe_last_sync;
use floratrack_core::{check_server, MutationStatus, SyncFailure, SyncOutcome, SyncSettings};

use super::OutputFormat;
use crate::config::Config;
use crate::sync::{connect, open_store};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Sync even if the server looks unreachable
    #[arg(long)]
    force: bool,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration, queued changes and server status
    Status,
}

impl SyncCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| SyncCommandError::RuntimeError(e.to_string()))?;

        match &self.command {
            None => rt.block_on(self.sync(config)),
            Some(SyncSubcommand::Status) => rt.block_on(self.status(config)),
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let settings = SyncSettings {
            auto_sync: false,
            ..config.sync.settings()
        };
        let service = connect(config, &settings).await?;

        if matches!(self.format, OutputFormat::Text) {
            println!("Syncing with server...");
        }
        let outcome = service.sync(self.force).await;
        service.shutdown();

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            OutputFormat::Text => print_outcome(&outcome),
        }

        if outcome.is_success() {
            Ok(())
        } else {
            Err(SyncCommandError::Failed(outcome.error.clone().unwrap_or_else(|| SyncFailure {
                kind: floratrack_core::ErrorKind::Transient,
                message: outcome.summary(),
            }))
            .into())
        }
    }

    async fn status(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let (_, store) = open_store(config)?;
        let journal = store.journal();
        println!(
            "Last sync: {}",
            describe_last_sync(store.cursor(), Utc::now())
        );
        println!(
            "Queued:    {} pending, {} failed",
            journal.count_with_status(MutationStatus::Pending)
                + journal.count_with_status(MutationStatus::InFlight),
            journal.count_with_status(MutationStatus::Failed)
        );
        println!();

        let Some(server_url) = config.sync.server_url.as_ref() else {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"http://localhost:8080\"");
            println!("    api_key: \"your-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  FLORA_SYNC_URL, FLORA_SYNC_API_KEY");
            return Ok(());
        };

        println!("Server:    {}", server_url);
        println!(
            "API key:   {}",
            if config.sync.api_key.is_some() {
                "set"
            } else {
                "missing"
            }
        );
        println!(
            "Auto-sync: {}",
            if config.sync.auto_sync {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!();

        print!("Server status: ");
        if check_server(server_url).await {
            println!("✓ reachable");
        } else {
            println!("✗ unreachable");
        }

        Ok(())
    }
}

fn print_outcome(outcome: &SyncOutcome) {
    println!();
    if outcome.full_pull {
        println!("  Pulled a full snapshot");
    }
    for (entity_type, count) in &outcome.pulled.applied {
        println!("  ↓ {} {}", count, entity_type.plural());
    }
    if outcome.pulled.removed > 0 {
        println!("  ↓ {} removed", outcome.pulled.removed);
    }
    for (entity_type, count) in &outcome.pushed {
        println!("  ↑ {} {}", count, entity_type.plural());
    }
    for conflict in &outcome.conflicts {
        println!(
            "  ! {} of {} overruled by server (version {})",
            conflict.operation, conflict.key, conflict.server_version
        );
    }
    for rejection in &outcome.rejections {
        println!("  ✗ {} rejected: {}", rejection.key, rejection.reason);
    }
    println!();

    if outcome.is_success() {
        println!("Sync complete: {}.", outcome.summary());
    } else if outcome.outstanding_failed > 0 {
        println!(
            "{} change(s) failed. See 'flora journal list --failed'.",
            outcome.outstanding_failed
        );
    }
    if !outcome.deferred.is_empty() {
        println!(
            "{} change(s) wait for a referenced crop or order to sync first.",
            outcome.deferred.len()
        );
    }
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    Failed(SyncFailure),
    RuntimeError(String),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::Failed(failure) => write!(f, "Sync failed: {}", failure),
            SyncCommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {}
