//! Durable storage for the booking saga orchestrator.
//!
//! Four stores back the saga runtime:
//! - [`CorrelationStore`]: one record per saga instance, updated with
//!   optimistic concurrency (version compare-and-swap)
//! - [`OutboxStore`]: effects planned by a save and not yet performed
//! - [`TimeoutStore`]: the arena of scheduled timeouts (token -> deadline)
//! - [`DeadLetterStore`]: side effects that failed after retries
//!
//! Each store has an in-memory implementation for tests and single-node
//! runs, and a PostgreSQL implementation for production.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{CorrelationId, DeadLetterId, TimeoutTokenId};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use record::{DeadLetter, OutboxEntry, SagaRecord, ScheduledTimeout, Version};
pub use store::{CorrelationStore, DeadLetterStore, OutboxStore, TimeoutStore};
