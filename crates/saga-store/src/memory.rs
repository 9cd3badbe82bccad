use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    CorrelationId, DeadLetter, DeadLetterId, OutboxEntry, Result, SagaRecord, ScheduledTimeout,
    StoreError, TimeoutTokenId, Version,
    store::{CorrelationStore, DeadLetterStore, OutboxStore, TimeoutStore},
};

/// In-memory saga store for tests and single-node runs.
///
/// Implements all four store traits with the same semantics as the
/// PostgreSQL implementation. State is shared between clones.
///
/// Saves take the saga lock and then the outbox lock, so a record and its
/// outbox entries become visible together.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<CorrelationId, SagaRecord>>>,
    outbox: Arc<RwLock<HashMap<CorrelationId, Vec<OutboxEntry>>>>,
    timeouts: Arc<RwLock<HashMap<TimeoutTokenId, ScheduledTimeout>>>,
    dead_letters: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored saga instances.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Returns the number of outbox entries not yet settled.
    pub async fn outbox_count(&self) -> usize {
        self.outbox.read().await.values().map(Vec::len).sum()
    }

    /// Returns the number of stored timeouts, leased or not.
    pub async fn timeout_count(&self) -> usize {
        self.timeouts.read().await.len()
    }

    /// Returns the number of dead letters.
    pub async fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().await.len()
    }

    /// Clears all stored state.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
        self.outbox.write().await.clear();
        self.timeouts.write().await.clear();
        self.dead_letters.write().await.clear();
    }

    async fn append_outbox(&self, version: Version, entries: Vec<OutboxEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut outbox = self.outbox.write().await;
        for mut entry in entries {
            entry.version = version;
            outbox.entry(entry.correlation_id).or_default().push(entry);
        }
    }
}

#[async_trait]
impl CorrelationStore for InMemorySagaStore {
    async fn insert(&self, mut record: SagaRecord, outbox: Vec<OutboxEntry>) -> Result<Version> {
        let mut sagas = self.sagas.write().await;

        if sagas.contains_key(&record.correlation_id) {
            return Err(StoreError::AlreadyExists(record.correlation_id));
        }

        record.version = Version::first();
        sagas.insert(record.correlation_id, record);
        self.append_outbox(Version::first(), outbox).await;
        Ok(Version::first())
    }

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaRecord>> {
        Ok(self.sagas.read().await.get(&correlation_id).cloned())
    }

    async fn update(
        &self,
        mut record: SagaRecord,
        expected: Version,
        outbox: Vec<OutboxEntry>,
    ) -> Result<Version> {
        let correlation_id = record.correlation_id;
        let mut sagas = self.sagas.write().await;

        let current = sagas
            .get_mut(&correlation_id)
            .ok_or(StoreError::NotFound(correlation_id))?;

        if current.version != expected {
            return Err(StoreError::ConcurrencyConflict {
                correlation_id,
                expected,
                actual: current.version,
            });
        }

        let new_version = expected.next();
        record.version = new_version;
        record.created_at = current.created_at;
        *current = record;
        self.append_outbox(new_version, outbox).await;
        Ok(new_version)
    }

    async fn find_by_status(&self, status: &str, limit: usize) -> Result<Vec<SagaRecord>> {
        let sagas = self.sagas.read().await;
        let mut records: Vec<_> = sagas
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl OutboxStore for InMemorySagaStore {
    async fn pending_outbox(&self, correlation_id: CorrelationId) -> Result<Vec<OutboxEntry>> {
        let outbox = self.outbox.read().await;
        let mut pending = outbox.get(&correlation_id).cloned().unwrap_or_default();
        pending.sort_by_key(|e| (e.version, e.seq));
        Ok(pending)
    }

    async fn settle(
        &self,
        correlation_id: CorrelationId,
        version: Version,
        seq: u32,
    ) -> Result<bool> {
        let mut outbox = self.outbox.write().await;
        let Some(entries) = outbox.get_mut(&correlation_id) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| !(e.version == version && e.seq == seq));
        let settled = entries.len() != before;
        if entries.is_empty() {
            outbox.remove(&correlation_id);
        }
        Ok(settled)
    }

    async fn stale_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CorrelationId>> {
        let outbox = self.outbox.read().await;
        let mut stale: Vec<_> = outbox
            .iter()
            .filter_map(|(id, entries)| {
                entries
                    .iter()
                    .map(|e| e.created_at)
                    .min()
                    .filter(|oldest| *oldest <= older_than)
                    .map(|oldest| (oldest, *id))
            })
            .collect();
        stale.sort_by_key(|(oldest, _)| *oldest);
        Ok(stale.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}

#[async_trait]
impl TimeoutStore for InMemorySagaStore {
    async fn schedule(&self, mut timeout: ScheduledTimeout) -> Result<()> {
        timeout.claimed_until = None;
        self.timeouts
            .write()
            .await
            .insert(timeout.token_id, timeout);
        Ok(())
    }

    async fn cancel(&self, token_id: TimeoutTokenId) -> Result<bool> {
        Ok(self.timeouts.write().await.remove(&token_id).is_some())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTimeout>> {
        let mut timeouts = self.timeouts.write().await;

        let mut due: Vec<_> = timeouts
            .values()
            .filter(|t| t.is_claimable(now))
            .map(|t| (t.deadline, t.token_id))
            .collect();
        due.sort();
        due.truncate(limit);

        Ok(due
            .into_iter()
            .filter_map(|(_, token_id)| {
                let timeout = timeouts.get_mut(&token_id)?;
                timeout.claimed_until = Some(lease_until);
                Some(timeout.clone())
            })
            .collect())
    }

    async fn release(&self, token_id: TimeoutTokenId, due_at: DateTime<Utc>) -> Result<bool> {
        let mut timeouts = self.timeouts.write().await;
        let Some(timeout) = timeouts.get_mut(&token_id) else {
            return Ok(false);
        };
        timeout.claimed_until = None;
        timeout.deadline = due_at;
        Ok(true)
    }

    async fn pending_for(&self, correlation_id: CorrelationId) -> Result<Vec<ScheduledTimeout>> {
        let timeouts = self.timeouts.read().await;
        let mut pending: Vec<_> = timeouts
            .values()
            .filter(|t| t.correlation_id == correlation_id)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.deadline);
        Ok(pending)
    }
}

#[async_trait]
impl DeadLetterStore for InMemorySagaStore {
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        self.dead_letters.write().await.push(letter);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.dead_letters.read().await;
        Ok(letters.iter().take(limit).cloned().collect())
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        let letters = self.dead_letters.read().await;
        Ok(letters.iter().find(|l| l.id == id).cloned())
    }

    async fn remove(&self, id: DeadLetterId) -> Result<bool> {
        let mut letters = self.dead_letters.write().await;
        let before = letters.len();
        letters.retain(|l| l.id != id);
        Ok(letters.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_record(correlation_id: CorrelationId, status: &str) -> SagaRecord {
        let now = Utc::now();
        SagaRecord {
            correlation_id,
            saga_type: "TestSaga".to_string(),
            status: status.to_string(),
            terminal: false,
            version: Version::initial(),
            payload: serde_json::json!({"test": true}),
            created_at: now,
            updated_at: now,
        }
    }

    fn create_test_timeout(correlation_id: CorrelationId, deadline: DateTime<Utc>) -> ScheduledTimeout {
        ScheduledTimeout {
            token_id: TimeoutTokenId::new(),
            correlation_id,
            kind: "payment".to_string(),
            deadline,
            payload: serde_json::json!({"fired": true}),
            scheduled_at: Utc::now(),
            claimed_until: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();

        let version = store.insert(create_test_record(id, "Started"), vec![]).await.unwrap();
        assert_eq!(version, Version::first());

        let record = CorrelationStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.version, Version::first());
        assert_eq!(record.status, "Started");
        assert_eq!(store.saga_count().await, 1);
    }

    #[tokio::test]
    async fn insert_twice_is_rejected() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();

        store.insert(create_test_record(id, "Started"), vec![]).await.unwrap();
        let result = store.insert(create_test_record(id, "Started"), vec![]).await;

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn update_with_expected_version() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        store.insert(create_test_record(id, "Started"), vec![]).await.unwrap();

        let version = store
            .update(create_test_record(id, "Running"), Version::first(), vec![])
            .await
            .unwrap();
        assert_eq!(version, Version::new(2));

        let record = CorrelationStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.status, "Running");
        assert_eq!(record.version, Version::new(2));
    }

    #[tokio::test]
    async fn concurrency_conflict_on_stale_version() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        store.insert(create_test_record(id, "Started"), vec![]).await.unwrap();
        store
            .update(create_test_record(id, "Running"), Version::first(), vec![])
            .await
            .unwrap();

        let result = store
            .update(create_test_record(id, "Stale"), Version::first(), vec![])
            .await;

        match result {
            Err(StoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, Version::first());
                assert_eq!(actual, Version::new(2));
            }
            other => panic!("Expected ConcurrencyConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn update_missing_record() {
        let store = InMemorySagaStore::new();
        let result = store
            .update(create_test_record(CorrelationId::new(), "Running"), Version::first(), vec![])
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_preserves_created_at() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let original = create_test_record(id, "Started");
        let created_at = original.created_at;
        store.insert(original, vec![]).await.unwrap();

        let mut later = create_test_record(id, "Running");
        later.created_at = created_at + Duration::hours(1);
        store.update(later, Version::first(), vec![]).await.unwrap();

        let record = CorrelationStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.created_at, created_at);
    }

    #[tokio::test]
    async fn find_by_status_filters_and_limits() {
        let store = InMemorySagaStore::new();
        for _ in 0..3 {
            store
                .insert(create_test_record(CorrelationId::new(), "Waiting"), vec![])
                .await
                .unwrap();
        }
        store
            .insert(create_test_record(CorrelationId::new(), "Completed"), vec![])
            .await
            .unwrap();

        assert_eq!(store.find_by_status("Waiting", 10).await.unwrap().len(), 3);
        assert_eq!(store.find_by_status("Waiting", 2).await.unwrap().len(), 2);
        assert_eq!(store.find_by_status("Completed", 10).await.unwrap().len(), 1);
        assert!(store.find_by_status("Unknown", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_due_returns_only_expired_in_deadline_order() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let now = Utc::now();

        let late = create_test_timeout(id, now - Duration::seconds(1));
        let early = create_test_timeout(id, now - Duration::seconds(10));
        let future = create_test_timeout(id, now + Duration::minutes(5));
        store.schedule(late.clone()).await.unwrap();
        store.schedule(early.clone()).await.unwrap();
        store.schedule(future.clone()).await.unwrap();

        let lease_until = now + Duration::seconds(30);
        let claimed = store.claim_due(now, lease_until, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].token_id, early.token_id);
        assert_eq!(claimed[1].token_id, late.token_id);
        assert_eq!(claimed[0].claimed_until, Some(lease_until));

        // Leased entries stay stored but are not handed out twice.
        assert!(store.claim_due(now, lease_until, 10).await.unwrap().is_empty());
        assert_eq!(store.timeout_count().await, 3);
    }

    #[tokio::test]
    async fn expired_lease_makes_timeout_claimable_again() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();
        let timeout = create_test_timeout(CorrelationId::new(), now);
        store.schedule(timeout.clone()).await.unwrap();

        let lease_until = now + Duration::seconds(30);
        assert_eq!(store.claim_due(now, lease_until, 10).await.unwrap().len(), 1);

        // The claimer never completed the timeout.
        let reclaimed = store
            .claim_due(lease_until, lease_until + Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].token_id, timeout.token_id);

        assert!(store.cancel(timeout.token_id).await.unwrap());
        assert_eq!(store.timeout_count().await, 0);
    }

    #[tokio::test]
    async fn release_drops_lease() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();
        let timeout = create_test_timeout(CorrelationId::new(), now - Duration::seconds(5));
        store.schedule(timeout.clone()).await.unwrap();
        let lease_until = now + Duration::minutes(1);
        store.claim_due(now, lease_until, 10).await.unwrap();

        assert!(store.release(timeout.token_id, now).await.unwrap());

        let again = store.claim_due(now, lease_until, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].deadline, now);
        assert!(!store.release(TimeoutTokenId::new(), now).await.unwrap());
    }

    #[tokio::test]
    async fn claim_due_respects_limit() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store
                .schedule(create_test_timeout(
                    CorrelationId::new(),
                    now - Duration::seconds(i),
                ))
                .await
                .unwrap();
        }

        let lease_until = now + Duration::seconds(30);
        assert_eq!(store.claim_due(now, lease_until, 3).await.unwrap().len(), 3);
        assert_eq!(store.claim_due(now, lease_until, 3).await.unwrap().len(), 2);
        assert!(store.claim_due(now, lease_until, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_pending_timeout() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let timeout = create_test_timeout(id, Utc::now() - Duration::seconds(1));
        store.schedule(timeout.clone()).await.unwrap();

        assert!(store.cancel(timeout.token_id).await.unwrap());
        assert!(!store.cancel(timeout.token_id).await.unwrap());
        let now = Utc::now();
        assert!(
            store
                .claim_due(now, now + Duration::seconds(30), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn schedule_same_token_replaces_entry() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let mut timeout = create_test_timeout(id, Utc::now() + Duration::minutes(1));
        store.schedule(timeout.clone()).await.unwrap();

        timeout.deadline = Utc::now() + Duration::minutes(2);
        store.schedule(timeout.clone()).await.unwrap();

        let pending = store.pending_for(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deadline, timeout.deadline);
    }

    fn create_test_entry(correlation_id: CorrelationId, seq: u32) -> OutboxEntry {
        OutboxEntry {
            correlation_id,
            version: Version::initial(),
            seq,
            effect_kind: "publish".to_string(),
            payload: serde_json::json!({"seq": seq}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn outbox_is_written_with_the_record() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        store
            .insert(
                create_test_record(id, "Started"),
                vec![create_test_entry(id, 0), create_test_entry(id, 1)],
            )
            .await
            .unwrap();
        store
            .update(
                create_test_record(id, "Running"),
                Version::first(),
                vec![create_test_entry(id, 0)],
            )
            .await
            .unwrap();

        let pending = store.pending_outbox(id).await.unwrap();
        let keys: Vec<_> = pending.iter().map(|e| (e.version, e.seq)).collect();
        assert_eq!(
            keys,
            vec![
                (Version::first(), 0),
                (Version::first(), 1),
                (Version::new(2), 0)
            ]
        );
    }

    #[tokio::test]
    async fn failed_save_writes_no_outbox() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        store.insert(create_test_record(id, "Started"), vec![]).await.unwrap();

        let duplicate = store
            .insert(create_test_record(id, "Started"), vec![create_test_entry(id, 0)])
            .await;
        assert!(duplicate.is_err());
        let stale = store
            .update(
                create_test_record(id, "Running"),
                Version::new(7),
                vec![create_test_entry(id, 0)],
            )
            .await;
        assert!(stale.is_err());

        assert_eq!(store.outbox_count().await, 0);
    }

    #[tokio::test]
    async fn settle_and_stale_outbox() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        store
            .insert(
                create_test_record(id, "Started"),
                vec![create_test_entry(id, 0), create_test_entry(id, 1)],
            )
            .await
            .unwrap();

        let now = Utc::now();
        assert!(
            store
                .stale_outbox(now - Duration::minutes(1), 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.stale_outbox(now, 10).await.unwrap(), vec![id]);

        assert!(store.settle(id, Version::first(), 0).await.unwrap());
        assert!(!store.settle(id, Version::first(), 0).await.unwrap());
        assert_eq!(store.outbox_count().await, 1);

        assert!(store.settle(id, Version::first(), 1).await.unwrap());
        assert!(store.pending_outbox(id).await.unwrap().is_empty());
        assert!(store.stale_outbox(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_lifecycle() {
        let store = InMemorySagaStore::new();
        let letter = DeadLetter {
            id: DeadLetterId::new(),
            correlation_id: CorrelationId::new(),
            effect_kind: "publish".to_string(),
            payload: serde_json::json!({"type": "CancelBooking"}),
            last_error: "bus unavailable".to_string(),
            attempts: 5,
            created_at: Utc::now(),
        };

        store.record(letter.clone()).await.unwrap();
        assert_eq!(store.dead_letter_count().await, 1);
        assert_eq!(
            DeadLetterStore::get(&store, letter.id).await.unwrap(),
            Some(letter.clone())
        );
        assert_eq!(store.list(10).await.unwrap().len(), 1);

        assert!(store.remove(letter.id).await.unwrap());
        assert!(!store.remove(letter.id).await.unwrap());
        assert!(store.list(10).await.unwrap().is_empty());
    }
}
