use thiserror::Error;

use crate::{CorrelationId, Version};

/// Errors that can occur when interacting with the saga stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version did not match the expected version.
    #[error(
        "Concurrency conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// A saga instance with this correlation id already exists.
    #[error("Saga already exists: {0}")]
    AlreadyExists(CorrelationId),

    /// The saga instance was not found.
    #[error("Saga not found: {0}")]
    NotFound(CorrelationId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::AlreadyExists(_)
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
