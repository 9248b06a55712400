//! FloraTrack Core Library
//!
//! Local-first storage and sync for FloraTrack clients: a local store with a
//! mutation journal, the engine that reconciles it with the server, and the
//! connectivity and status plumbing around them.

pub mod connectivity;
pub mod models;
pub mod service;
pub mod status;
pub mod store;
pub mod sync;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, HttpProbe, Probe};
pub use models::{
    Entity, EntityKey, EntityType, Fields, LocalMutation, MutationRecord, MutationStatus,
    Operation, ValidationError,
};
pub use service::{SyncService, SyncSettings};
pub use status::{Subscription, SyncPhase, SyncState, SyncStatusReporter};
pub use store::{LocalStore, SharedStore, StoreError, StoreFile};
pub use sync::{
    check_server, ErrorKind, HttpRemote, RemoteService, RetryPolicy, SyncEngine, SyncError,
    SyncFailure, SyncOutcome,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
