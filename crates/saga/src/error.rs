//! Saga error types.

use common::{CorrelationId, DeadLetterId};
use saga_store::StoreError;
use thiserror::Error;

use crate::bus::BusError;

/// Errors that can occur while dispatching saga messages.
///
/// Business failures (declined payments, unconfirmed bookings) are not
/// errors: they arrive as ordinary events and drive compensation.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Every retry of a conflicting save lost the race.
    #[error("Concurrency retries exhausted for saga {correlation_id} after {attempts} attempts")]
    ConcurrencyRetriesExhausted {
        correlation_id: CorrelationId,
        attempts: u32,
    },

    /// A stored record could not be turned back into a saga instance.
    #[error("Invalid saga record {correlation_id}: {reason}")]
    InvalidRecord {
        correlation_id: CorrelationId,
        reason: String,
    },

    /// Dead letter not found.
    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// Redriving a dead letter failed again; the letter is kept.
    #[error("Redrive of dead letter {id} failed: {reason}")]
    RedriveFailed { id: DeadLetterId, reason: String },

    /// Message bus error.
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the error is an optimistic-concurrency loss that a
    /// re-fetch and retry can resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaError::Store(e) if e.is_conflict())
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::ConcurrencyRetriesExhausted { .. } => true,
            SagaError::Bus(e) => e.is_retryable(),
            SagaError::Store(StoreError::Serialization(_)) => false,
            SagaError::Store(_) => true,
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
