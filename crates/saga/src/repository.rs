//! Loads and saves saga instances through a [`CorrelationStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::CorrelationId;
use saga_store::{CorrelationStore, SagaRecord, Version};

use crate::effects::Effect;
use crate::error::{Result, SagaError};
use crate::instance::{SAGA_TYPE, SagaInstance};
use crate::state::SagaState;

/// Maps [`SagaInstance`]s to stored [`SagaRecord`]s.
#[derive(Clone)]
pub struct SagaRepository {
    store: Arc<dyn CorrelationStore>,
}

impl SagaRepository {
    pub fn new(store: Arc<dyn CorrelationStore>) -> Self {
        Self { store }
    }

    /// Loads an instance, or `None` if no saga exists for the id.
    pub async fn load(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>> {
        let Some(record) = self.store.get(correlation_id).await? else {
            return Ok(None);
        };
        if record.saga_type != SAGA_TYPE {
            return Err(SagaError::InvalidRecord {
                correlation_id,
                reason: format!("unexpected saga type {}", record.saga_type),
            });
        }

        let mut instance: SagaInstance =
            serde_json::from_value(record.payload).map_err(|e| SagaError::InvalidRecord {
                correlation_id,
                reason: e.to_string(),
            })?;
        instance.set_version(record.version);
        Ok(Some(instance))
    }

    /// Loads an instance or returns a fresh unsaved one.
    pub async fn get_or_create(
        &self,
        correlation_id: CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<SagaInstance> {
        Ok(self
            .load(correlation_id)
            .await?
            .unwrap_or_else(|| SagaInstance::new(correlation_id, now)))
    }

    /// Saves an instance with a version compare-and-swap, writing `effects`
    /// to the outbox in the same step.
    ///
    /// Unsaved instances are inserted; inserting over an existing saga is a
    /// conflict like a stale update. On success the instance carries the new
    /// version.
    #[tracing::instrument(skip(self, instance, effects), fields(correlation_id = %instance.correlation_id(), state = %instance.state(), expected_version = %instance.version(), effects = effects.len()))]
    pub async fn save(&self, instance: &mut SagaInstance, effects: &[Effect]) -> Result<Version> {
        let expected = instance.version();
        let outbox = Effect::outbox_entries(instance.correlation_id(), effects, Utc::now())?;
        let record = SagaRecord {
            correlation_id: instance.correlation_id(),
            saga_type: SAGA_TYPE.to_string(),
            status: instance.state().as_str().to_string(),
            terminal: instance.is_terminal(),
            version: expected,
            payload: serde_json::to_value(&*instance)?,
            created_at: instance.created_at(),
            updated_at: instance.updated_at(),
        };

        let version = if expected == Version::initial() {
            self.store.insert(record, outbox).await?
        } else {
            self.store.update(record, expected, outbox).await?
        };
        instance.set_version(version);
        Ok(version)
    }

    /// Lists instances currently in `state`.
    pub async fn find_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>> {
        let records = self.store.find_by_status(state.as_str(), limit).await?;
        records
            .into_iter()
            .map(|record| {
                let correlation_id = record.correlation_id;
                let mut instance: SagaInstance = serde_json::from_value(record.payload)
                    .map_err(|e| SagaError::InvalidRecord {
                        correlation_id,
                        reason: e.to_string(),
                    })?;
                instance.set_version(record.version);
                Ok(instance)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_store::{InMemorySagaStore, OutboxStore, StoreError};

    #[tokio::test]
    async fn test_save_inserts_then_updates() {
        let repository = SagaRepository::new(Arc::new(InMemorySagaStore::new()));
        let id = CorrelationId::new();
        let mut saga = SagaInstance::new(id, Utc::now());

        assert_eq!(repository.save(&mut saga, &[]).await.unwrap(), Version::first());
        saga.state = SagaState::WaitingForPaymentInitiation;
        assert_eq!(repository.save(&mut saga, &[]).await.unwrap(), Version::new(2));

        let loaded = repository.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.version(), Version::new(2));
        assert_eq!(loaded.state(), SagaState::WaitingForPaymentInitiation);
        assert_eq!(loaded, saga);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let repository = SagaRepository::new(Arc::new(InMemorySagaStore::new()));
        let id = CorrelationId::new();
        let mut saga = SagaInstance::new(id, Utc::now());
        repository.save(&mut saga, &[]).await.unwrap();

        let mut a = repository.load(id).await.unwrap().unwrap();
        let mut b = repository.load(id).await.unwrap().unwrap();
        repository.save(&mut a, &[]).await.unwrap();

        let err = repository.save(&mut b, &[]).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(
            err,
            SagaError::Store(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_insert_conflicts() {
        let repository = SagaRepository::new(Arc::new(InMemorySagaStore::new()));
        let id = CorrelationId::new();
        repository
            .save(&mut SagaInstance::new(id, Utc::now()), &[])
            .await
            .unwrap();

        let err = repository
            .save(&mut SagaInstance::new(id, Utc::now()), &[])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_get_or_create_and_find_by_state() {
        let repository = SagaRepository::new(Arc::new(InMemorySagaStore::new()));
        let id = CorrelationId::new();

        let fresh = repository.get_or_create(id, Utc::now()).await.unwrap();
        assert_eq!(fresh.version(), Version::initial());
        assert!(repository.load(id).await.unwrap().is_none());

        let mut saga = fresh;
        repository.save(&mut saga, &[]).await.unwrap();
        let found = repository
            .find_by_state(SagaState::Initial, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].correlation_id(), id);
        assert_eq!(found[0].version(), Version::first());
    }

    #[tokio::test]
    async fn test_save_writes_effects_to_outbox() {
        let store = InMemorySagaStore::new();
        let repository = SagaRepository::new(Arc::new(store.clone()));
        let id = CorrelationId::new();
        let mut saga = SagaInstance::new(id, Utc::now());
        let effects = [Effect::CancelTimeout {
            kind: crate::timeout::TimeoutKind::Payment,
            token_id: common::TimeoutTokenId::new(),
        }];

        let version = repository.save(&mut saga, &effects).await.unwrap();

        let pending = store.pending_outbox(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, version);
        assert_eq!(pending[0].effect_kind, "cancel_timeout");
        let effect: Effect = serde_json::from_value(pending[0].payload.clone()).unwrap();
        assert_eq!(effect, effects[0]);
    }
}
