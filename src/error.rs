//! Error types for the recommender core and its storage collaborators.

use crate::models::EntityKind;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for recommender operations.
pub type MfResult<T> = Result<T, MfError>;

/// Errors that can occur while training, updating, querying or persisting the model.
#[derive(Error, Debug)]
pub enum MfError {
    /// Caller supplied input that can never succeed (empty training set, zero top_k, NaN rating)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No fitted model is loaded
    #[error("Model has not been trained yet")]
    NotReady,

    /// Recommendation asked for a user the identity index has never seen
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Unknown item: {0}")]
    UnknownItem(String),

    /// Dense index outside the current bounds of the factor store
    #[error("{kind} index {index} out of range (len {len})")]
    IndexOutOfRange {
        kind: EntityKind,
        index: usize,
        len: usize,
    },

    /// An update would have produced NaN or infinite parameters
    #[error("Numeric divergence: {0}")]
    Diverged(String),

    /// Another process saved the snapshot while this one was mutating it
    #[error("Snapshot changed concurrently, expected {expected:?} found {found:?}")]
    SnapshotConflict {
        expected: Option<String>,
        found: Option<String>,
    },

    /// Replay found nothing newer than the watermark
    #[error("No new ratings since {watermark:?}")]
    NoNewRatings { watermark: Option<DateTime<Utc>> },

    /// Snapshot failed structural validation
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Identity store error: {0}")]
    IdentityStore(#[from] redis::RedisError),
}

impl MfError {
    pub fn invalid(message: impl Into<String>) -> Self {
        MfError::InvalidInput(message.into())
    }

    /// Durable read/write failures. These are fatal to the calling operation.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            MfError::CorruptSnapshot(_)
                | MfError::Io(_)
                | MfError::Serialization(_)
                | MfError::Database(_)
                | MfError::IdentityStore(_)
        )
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, MfError::NoNewRatings { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MfError::NoNewRatings { watermark: None }.is_noop());
        assert!(!MfError::NotReady.is_persistence());
        assert!(MfError::CorruptSnapshot("bad".into()).is_persistence());

        let err = MfError::IndexOutOfRange {
            kind: EntityKind::Item,
            index: 7,
            len: 2,
        };
        assert_eq!(err.to_string(), "item index 7 out of range (len 2)");
    }
}
