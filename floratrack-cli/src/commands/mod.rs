use clap::ValueEnum;

mod config_cmd;
mod entity;
mod journal;
mod reset;
mod sync_cmd;
mod watch;

pub use config_cmd::ConfigCommand;
pub use entity::EntityCommand;
pub use journal::JournalCommand;
pub use reset::ResetCommand;
pub use sync_cmd::SyncCommand;
pub use watch::WatchCommand;

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
