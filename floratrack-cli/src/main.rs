use clap::{Parser, Subcommand};
use floratrack_core::EntityType;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod sync;

use commands::{
    ConfigCommand, EntityCommand, JournalCommand, ResetCommand, SyncCommand, WatchCommand,
};
use config::Config;
use sync::try_auto_sync;

#[derive(Parser)]
#[command(name = "flora")]
#[command(version)]
#[command(about = "Nursery crop, task and order tracking that works offline", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage crops
    Crop(EntityCommand),

    /// Manage tasks
    Task(EntityCommand),

    /// Manage propagation orders
    Order(EntityCommand),

    /// Sync with remote server
    Sync(SyncCommand),

    /// Inspect and manage queued changes
    Journal(JournalCommand),

    /// Discard local data and pull everything from the server
    Reset(ResetCommand),

    /// Keep syncing in the foreground
    Watch(WatchCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let cli_config_path = cli.config.clone();
    let config = Config::load(cli.config)?;

    // Auto-sync BEFORE read commands
    if is_read_command(&cli.command) {
        try_auto_sync(&config);
    }

    let result = execute_command(&cli.command, &config, cli_config_path);

    // Auto-sync AFTER write commands (only if command succeeded)
    if result.is_ok() && is_write_command(&cli.command) {
        try_auto_sync(&config);
    }

    result
}

fn execute_command(
    command: &Option<Commands>,
    config: &Config,
    cli_config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Some(Commands::Crop(cmd)) => cmd.run(EntityType::Crop, config),
        Some(Commands::Task(cmd)) => cmd.run(EntityType::Task, config),
        Some(Commands::Order(cmd)) => cmd.run(EntityType::Order, config),
        Some(Commands::Sync(cmd)) => cmd.run(config),
        Some(Commands::Journal(cmd)) => cmd.run(config),
        Some(Commands::Reset(cmd)) => cmd.run(config),
        Some(Commands::Watch(cmd)) => cmd.run(config),
        Some(Commands::Config(cmd)) => cmd.run(config, cli_config_path),
        None => {
            println!("Use --help to see available commands");
            Ok(())
        }
    }
}

fn entity_command(cmd: &Option<Commands>) -> Option<&EntityCommand> {
    match cmd {
        Some(Commands::Crop(c) | Commands::Task(c) | Commands::Order(c)) => Some(c),
        _ => None,
    }
}

/// Returns true if the command is a read operation that should sync before execution.
fn is_read_command(cmd: &Option<Commands>) -> bool {
    entity_command(cmd).is_some_and(|c| c.command.is_read())
}

/// Returns true if the command is a write operation that should sync after execution.
fn is_write_command(cmd: &Option<Commands>) -> bool {
    entity_command(cmd).is_some_and(|c| c.command.is_write())
        || matches!(cmd, Some(Commands::Journal(j)) if j.command.is_write())
}
