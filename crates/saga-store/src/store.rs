use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    CorrelationId, DeadLetter, DeadLetterId, OutboxEntry, Result, SagaRecord, ScheduledTimeout,
    TimeoutTokenId, Version,
};

/// Storage of saga instances keyed by correlation id.
///
/// All implementations must be thread-safe (Send + Sync). Writes are
/// serialized per correlation id through the record version: at most one
/// of two concurrent updates expecting the same version succeeds.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Inserts a new saga record at [`Version::first`] together with the
    /// outbox entries of the transition that created it.
    ///
    /// Fails with `AlreadyExists` if a record with the same correlation id
    /// is already stored, in which case no outbox entry is written. The
    /// versions carried by `record` and `outbox` are ignored; entries are
    /// stamped with the stored version.
    async fn insert(&self, record: SagaRecord, outbox: Vec<OutboxEntry>) -> Result<Version>;

    /// Retrieves a saga record by correlation id.
    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaRecord>>;

    /// Replaces a saga record if its stored version equals `expected`, and
    /// appends `outbox` in the same atomic step.
    ///
    /// Returns the new version (`expected.next()`). Fails with
    /// `ConcurrencyConflict` on a version mismatch and `NotFound` if the
    /// record does not exist; on failure nothing is written.
    async fn update(
        &self,
        record: SagaRecord,
        expected: Version,
        outbox: Vec<OutboxEntry>,
    ) -> Result<Version>;

    /// Lists records in the given status, most recently updated first.
    async fn find_by_status(&self, status: &str, limit: usize) -> Result<Vec<SagaRecord>>;
}

/// Effects written by [`CorrelationStore`] saves and not yet performed.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Lists the pending entries of a saga in `(version, seq)` order.
    async fn pending_outbox(&self, correlation_id: CorrelationId) -> Result<Vec<OutboxEntry>>;

    /// Removes an entry once its effect was performed or dead-lettered.
    ///
    /// Returns false if the entry was already settled.
    async fn settle(&self, correlation_id: CorrelationId, version: Version, seq: u32)
    -> Result<bool>;

    /// Lists up to `limit` sagas holding entries created at or before
    /// `older_than`, oldest first.
    async fn stale_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CorrelationId>>;
}

/// Durable arena of scheduled timeouts.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Stores a timeout. Scheduling the same token again replaces the entry
    /// and drops any lease on it.
    async fn schedule(&self, timeout: ScheduledTimeout) -> Result<()>;

    /// Removes a timeout, leased or not.
    ///
    /// Returns false if the token was unknown (already delivered or
    /// cancelled).
    async fn cancel(&self, token_id: TimeoutTokenId) -> Result<bool>;

    /// Leases up to `limit` timeouts whose deadline is at or before `now`,
    /// earliest first, until `lease_until`.
    ///
    /// Claimed entries stay stored. While the lease is live no other call
    /// hands them out; once it expires they are claimable again, so an
    /// entry whose poller died is delivered later rather than lost. The
    /// poller removes an entry with [`cancel`](Self::cancel) after
    /// delivering it.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTimeout>>;

    /// Drops the lease on a timeout and makes it due at `due_at`.
    ///
    /// Returns false if the timeout no longer exists.
    async fn release(&self, token_id: TimeoutTokenId, due_at: DateTime<Utc>) -> Result<bool>;

    /// Lists pending timeouts for a saga instance.
    async fn pending_for(&self, correlation_id: CorrelationId) -> Result<Vec<ScheduledTimeout>>;
}

/// Storage of side effects that failed after retries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Records a dead letter.
    async fn record(&self, letter: DeadLetter) -> Result<()>;

    /// Lists dead letters, oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Retrieves a dead letter by id.
    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>>;

    /// Removes a dead letter. Returns false if it did not exist.
    async fn remove(&self, id: DeadLetterId) -> Result<bool>;
}
