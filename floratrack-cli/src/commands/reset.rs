use clap::Args;
use floratrack_core::{LocalStore, MutationStatus, StoreError, SyncSettings};
use std::io::{self, Write};

use crate::config::Config;
use crate::sync::{connect, store_file};

/// Discard local data and pull everything from the server again
#[derive(Args)]
pub struct ResetCommand {
    /// Skip confirmation prompt
    #[arg(long, short)]
    force: bool,
}

impl ResetCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !self.force {
            let queued = match store_file(config).load() {
                Ok(Some(store)) => store
                    .journal()
                    .iter()
                    .filter(|r| r.status != MutationStatus::Confirmed)
                    .count(),
                Ok(None) => 0,
                Err(StoreError::Corruption(_)) => 0,
                Err(e) => return Err(e.into()),
            };
            if queued > 0 {
                print!(
                    "{} unsynced change(s) will be lost. Reset local data? [y/N] ",
                    queued
                );
            } else {
                print!("Reset local data? [y/N] ");
            }
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Reset cancelled.");
                return Ok(());
            }
        }

        if !config.sync.is_configured() {
            store_file(config).save(&LocalStore::new())?;
            println!("Local data cleared.");
            return Ok(());
        }

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let settings = SyncSettings {
                auto_sync: false,
                ..config.sync.settings()
            };
            let service = connect(config, &settings).await?;
            service.reset_store().await?;
            println!("Local data cleared.");

            let outcome = service.sync(false).await;
            service.shutdown();
            if outcome.is_skipped() {
                println!("Server unreachable; data will be pulled on the next sync.");
            } else if outcome.is_success() {
                println!(
                    "Pulled {} record(s) from the server.",
                    outcome.pulled.total_applied()
                );
            } else if let Some(error) = outcome.error {
                println!("Pull failed: {}", error);
            }
            Ok::<(), Box<dyn std::error::Error>>(())
        })
    }
}
