//! Sync with the FloraTrack server.
//!
//! ## Protocol
//!
//! 1. `GET /sync/changes?since=<cursor>` returns entities changed since the
//!    cursor and the server time to use as the next cursor. 410 means the
//!    cursor is too old and a full snapshot must be pulled.
//! 2. `POST /sync/mutations` sends journal records; each gets a result of
//!    `confirmed`, `conflict` or `rejected`.
//!
//! A run always pulls before it pushes.

mod auto_sync;
mod engine;
mod error;
#[cfg(test)]
pub(crate) mod fake;
mod http;
mod outcome;
pub mod protocol;
mod remote;
mod retry;

pub use auto_sync::{AutoSync, DEFAULT_PERIODIC_INTERVAL};
pub use engine::SyncEngine;
pub use error::{ErrorKind, SyncError, SyncFailure};
pub use http::{build_http_url, check_server, status_error, HttpRemote, DEFAULT_REQUEST_TIMEOUT};
pub use outcome::{Rejection, RunStatus, SkipReason, SyncOutcome};
pub use protocol::{CHANGES_PATH, HEALTH_PATH, MUTATIONS_PATH};
pub use remote::RemoteService;
pub use retry::RetryPolicy;
