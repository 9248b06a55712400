//! FloraTrack reference sync server.
//!
//! Implements the changes/mutations contract that `floratrack-core` syncs
//! against. The binary lives in `src/bin/server.rs`.

pub mod server;
