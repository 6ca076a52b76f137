use thiserror::Error;

use crate::model::{EditableRecord, Field, RecordId};
use crate::sync::conflict::ConflictDescriptor;

/// Failure reported by a [`RecordStore`](crate::sync::RecordStore).
///
/// The transport tags each failure itself; callers never classify errors by
/// inspecting message text.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("version conflict on record {id}: expected version {expected}, server has {}", .current.version)]
    Conflict {
        id: RecordId,
        expected: i64,
        current: Box<EditableRecord>,
    },
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("{0}")]
    Server(String),
}

/// Outcome of a failed save, as seen by the caller of the coordinator.
#[derive(Debug, Clone, Error)]
pub enum SaveError {
    #[error("invalid value for {field}: {message}")]
    Validation { field: Field, message: String },
    #[error("record {} was changed elsewhere (version {} -> {})", .0.record_id, .0.baseline.version, .0.server.version)]
    Conflict(Box<ConflictDescriptor>),
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("{0}")]
    Server(String),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("record {0} is not in the displayed set")]
    UnknownRecord(RecordId),
    #[error("no active edit session")]
    NoSession,
    #[error("edit session for record {0} closed because the record is no longer displayed")]
    SessionClosed(RecordId),
    #[error("a save for record {0} is already in flight")]
    Busy(RecordId),
    #[error("{0}")]
    InvalidState(&'static str),
}

impl SaveError {
    /// Whether the failed write may be handed to the offline queue.
    pub fn is_queueable(&self) -> bool {
        matches!(self, SaveError::Network(_))
    }

    pub fn conflict(&self) -> Option<&ConflictDescriptor> {
        match self {
            SaveError::Conflict(descriptor) => Some(descriptor),
            _ => None,
        }
    }
}

impl From<StoreError> for SaveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Network(message) => SaveError::Network(message),
            StoreError::NotFound(id) => SaveError::NotFound(id),
            StoreError::Server(message) => SaveError::Server(message),
            conflict @ StoreError::Conflict { .. } => SaveError::Server(conflict.to_string()),
        }
    }
}
