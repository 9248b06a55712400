//! Glue between the CLI and the FloraTrack sync subsystem.
//!
//! Offline commands work on the local store file directly. Commands that
//! talk to the server open a [`SyncService`](floratrack_core::SyncService)
//! for the duration of the command.

pub mod auto_sync;
mod context;

pub use auto_sync::try_auto_sync;
pub use context::{connect, open_store, store_file};
