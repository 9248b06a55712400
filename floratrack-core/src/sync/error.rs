//! Sync error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::store::StoreError;

/// Stable tag of an error, shown in status and stored with failed mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Conflict,
    Validation,
    Auth,
    StorageCorruption,
    Storage,
    Protocol,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::StorageCorruption => "storage_corruption",
            ErrorKind::Storage => "storage",
            ErrorKind::Protocol => "protocol",
        }
    }

    /// Errors the user has to act on before sync can work again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::StorageCorruption)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while talking to the sync server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network trouble, timeouts, 5xx. Retried.
    #[error("Network error: {0}")]
    Transient(String),

    /// The server holds a newer version. Resolved automatically.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server refused the payload. Not retried.
    #[error("Rejected by server: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Local data is inconsistent. Sync stays disabled until the store is reset.
    #[error("Local storage is corrupted: {0}")]
    StorageCorruption(String),

    /// The local store could not be read, written or updated.
    #[error("Local storage error: {0}")]
    Store(String),

    /// The server no longer has changes this far back.
    #[error("Sync cursor expired")]
    CursorExpired,

    #[error("Sync protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::StorageCorruption(_) => ErrorKind::StorageCorruption,
            SyncError::Store(_) => ErrorKind::Storage,
            SyncError::CursorExpired | SyncError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn to_failure(&self) -> SyncFailure {
        SyncFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corruption(reason) => SyncError::StorageCorruption(reason),
            other => SyncError::Store(other.to_string()),
        }
    }
}

/// Kind and message of an error, kept after the error itself is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(SyncError::Transient("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(SyncError::CursorExpired.kind(), ErrorKind::Protocol);
        assert_eq!(
            SyncError::from(StoreError::Corruption("bad".into())).kind(),
            ErrorKind::StorageCorruption
        );
        assert_eq!(
            SyncError::from(StoreError::UnknownMutation("op-1".into())).kind(),
            ErrorKind::Storage
        );
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            SyncError::from(StoreError::Io("store.json".into(), io)).kind(),
            ErrorKind::Storage
        );
        assert!(SyncError::Transient("x".into()).is_transient());
        assert!(!SyncError::Auth("x".into()).is_transient());
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(ErrorKind::StorageCorruption.to_string(), "storage_corruption");
        assert_eq!(
            serde_json::to_value(ErrorKind::StorageCorruption).unwrap(),
            serde_json::json!("storage_corruption")
        );
    }

    #[test]
    fn test_failure_display() {
        let failure = SyncError::Auth("invalid API key".into()).to_failure();
        assert_eq!(failure.kind, ErrorKind::Auth);
        assert_eq!(
            failure.to_string(),
            "[auth] Authentication failed: invalid API key"
        );
    }
}
