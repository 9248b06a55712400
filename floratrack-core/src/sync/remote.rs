use chrono::{DateTime, Utc};
use std::future::Future;

use super::protocol::{ChangesResponse, PushResponse};
use super::SyncError;
use crate::models::MutationRecord;

/// The authoritative service the engine syncs against.
pub trait RemoteService: Send + Sync + 'static {
    /// Changes since a cursor, or everything when `since` is `None`.
    fn fetch_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<ChangesResponse, SyncError>> + Send;

    /// Sends mutations and returns one result per op id.
    fn push_mutations(
        &self,
        mutations: Vec<MutationRecord>,
    ) -> impl Future<Output = Result<PushResponse, SyncError>> + Send;
}
