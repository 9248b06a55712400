use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{EntityKey, MutationStatus, ValidationError};

/// Errors returned by [`LocalStore`](super::LocalStore) and [`StoreFile`](super::StoreFile).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(EntityKey),

    #[error("No mutation with id {0}")]
    UnknownMutation(String),

    #[error("Mutation {op_id} is {status}, expected {expected}")]
    InvalidStatus {
        op_id: String,
        status: MutationStatus,
        expected: MutationStatus,
    },

    #[error("Local store is corrupted: {0}")]
    Corruption(String),

    #[error("I/O error at {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}
