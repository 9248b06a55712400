use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::{SyncError, SyncFailure};
use crate::models::{EntityKey, EntityType};
use crate::store::{ConflictNotice, SnapshotStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another sync was in progress.
    AlreadyRunning,
    Offline,
    /// Sync is disabled until the store is reset.
    StorageCorrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum RunStatus {
    Completed,
    Skipped(SkipReason),
}

/// A mutation the server refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub op_id: String,
    pub key: EntityKey,
    pub reason: String,
}

/// What one call to [`SyncEngine::sync`](super::SyncEngine::sync) did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The pull ignored the cursor and fetched everything.
    pub full_pull: bool,
    pub pulled: SnapshotStats,
    /// Confirmed mutations per entity type.
    pub pushed: BTreeMap<EntityType, usize>,
    pub conflicts: Vec<ConflictNotice>,
    pub rejections: Vec<Rejection>,
    /// Mutations that ran out of retries during this run.
    pub failed: Vec<String>,
    /// Mutations held back because an entity they reference has no server
    /// id yet.
    pub deferred: Vec<String>,
    /// Failed mutations left in the journal after the run.
    pub outstanding_failed: usize,
    /// Mutations still waiting to be sent.
    pub outstanding_pending: usize,
    pub cursor_advanced: bool,
    /// Most important error encountered, if any.
    pub error: Option<SyncFailure>,
}

impl SyncOutcome {
    pub(crate) fn started() -> Self {
        let now = Utc::now();
        Self {
            status: RunStatus::Completed,
            started_at: now,
            finished_at: now,
            full_pull: false,
            pulled: SnapshotStats::default(),
            pushed: BTreeMap::new(),
            conflicts: Vec::new(),
            rejections: Vec::new(),
            failed: Vec::new(),
            deferred: Vec::new(),
            outstanding_failed: 0,
            outstanding_pending: 0,
            cursor_advanced: false,
            error: None,
        }
    }

    pub(crate) fn skipped(reason: SkipReason) -> Self {
        Self {
            status: RunStatus::Skipped(reason),
            ..Self::started()
        }
    }

    /// Records an error. The first one is kept, except that an auth or
    /// corruption error replaces an earlier error of any other kind.
    pub(crate) fn note_error(&mut self, error: &SyncError) {
        let replace = match &self.error {
            None => true,
            Some(current) => error.kind().is_fatal() && !current.kind.is_fatal(),
        };
        if replace {
            self.error = Some(error.to_failure());
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, RunStatus::Skipped(_))
    }

    /// Both phases ran to completion and nothing is left failed or deferred.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
            && self.error.is_none()
            && self.outstanding_failed == 0
            && self.deferred.is_empty()
    }

    pub fn total_pushed(&self) -> usize {
        self.pushed.values().sum()
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        match self.status {
            RunStatus::Skipped(SkipReason::AlreadyRunning) => "sync already running".to_string(),
            RunStatus::Skipped(SkipReason::Offline) => "offline, sync skipped".to_string(),
            RunStatus::Skipped(SkipReason::StorageCorrupted) => {
                "local storage corrupted, reset required".to_string()
            }
            RunStatus::Completed => {
                let mut parts = vec![
                    format!("pulled {}", self.pulled.total_applied() + self.pulled.removed),
                    format!("pushed {}", self.total_pushed()),
                ];
                if !self.conflicts.is_empty() {
                    parts.push(format!("{} conflict(s)", self.conflicts.len()));
                }
                if !self.rejections.is_empty() {
                    parts.push(format!("{} rejected", self.rejections.len()));
                }
                if !self.failed.is_empty() {
                    parts.push(format!("{} failed", self.failed.len()));
                }
                if !self.deferred.is_empty() {
                    parts.push(format!("{} deferred", self.deferred.len()));
                }
                parts.join(", ")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ErrorKind;

    #[test]
    fn test_first_error_wins() {
        let mut outcome = SyncOutcome::started();
        assert!(outcome.is_success());

        outcome.note_error(&SyncError::Validation("bad".into()));
        outcome.note_error(&SyncError::Transient("timed out".into()));
        assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Validation);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_auth_error_replaces_earlier_rejection() {
        let mut outcome = SyncOutcome::started();
        outcome.note_error(&SyncError::Validation("bad".into()));
        outcome.note_error(&SyncError::Auth("invalid API key".into()));
        assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Auth);

        outcome.note_error(&SyncError::StorageCorruption("bad journal".into()));
        outcome.note_error(&SyncError::Validation("worse".into()));
        assert_eq!(outcome.error.as_ref().unwrap().kind, ErrorKind::Auth);
    }

    #[test]
    fn test_deferred_is_not_success() {
        let mut outcome = SyncOutcome::started();
        outcome.deferred.push("op-1".to_string());
        assert!(!outcome.is_success());
        assert_eq!(outcome.summary(), "pulled 0, pushed 0, 1 deferred");
    }

    #[test]
    fn test_outstanding_failed_is_not_success() {
        let mut outcome = SyncOutcome::started();
        outcome.outstanding_failed = 1;
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_summary() {
        let mut outcome = SyncOutcome::started();
        outcome.pushed.insert(EntityType::Crop, 2);
        outcome.pushed.insert(EntityType::Task, 1);
        assert_eq!(outcome.summary(), "pulled 0, pushed 3");

        let skipped = SyncOutcome::skipped(SkipReason::AlreadyRunning);
        assert!(skipped.is_skipped());
        assert_eq!(skipped.summary(), "sync already running");
    }
}
