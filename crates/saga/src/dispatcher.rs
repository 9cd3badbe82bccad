//! Routes correlated events to saga instances.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::{CorrelationId, DeadLetterId};
use contracts::{Message, SagaEvent};
use saga_store::{
    CorrelationStore, DeadLetter, DeadLetterStore, OutboxStore, ScheduledTimeout, TimeoutStore,
    Version,
};

use crate::bus::MessageBus;
use crate::effects::{DELIVER_TIMEOUT_KIND, Effect, EffectExecutor};
use crate::engine::{Rejection, SagaEngine};
use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::repository::SagaRepository;
use crate::settings::SagaSettings;
use crate::state::SagaState;
use crate::timeout::TimeoutScheduler;

/// An event that changed a saga instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransition {
    pub correlation_id: CorrelationId,
    pub message_type: &'static str,
    pub from: SagaState,
    pub to: SagaState,
    /// Version after the save.
    pub version: Version,
    /// Load-run-save attempts needed, 1 without conflicts.
    pub attempts: u32,
    pub commands_published: usize,
    /// Effects that could not be performed and were dead-lettered.
    pub dead_letters: Vec<DeadLetterId>,
    /// Effects still in the outbox after the dispatch.
    pub pending_effects: usize,
}

/// An event that was logged and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredMessage {
    pub correlation_id: CorrelationId,
    pub message_type: &'static str,
    pub rejection: Rejection,
}

/// Result of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied(AppliedTransition),
    Ignored(IgnoredMessage),
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DispatchOutcome::Applied(_))
    }
}

/// Drives saga instances: load, run the engine, save, then execute effects.
///
/// Instances are serialized by the store's version compare-and-swap rather
/// than by locks. A dispatch that loses the race re-fetches the instance and
/// re-runs the engine with the same event.
///
/// Effects are saved to the outbox with the instance and flushed after the
/// save. A dispatch cut short after its save leaves them pending; the next
/// event for the saga, including a redelivery of the same event, flushes
/// them, and the timeout poller sweeps what is left.
pub struct SagaDispatcher {
    repository: SagaRepository,
    engine: SagaEngine,
    executor: EffectExecutor,
    max_conflict_retries: u32,
}

impl SagaDispatcher {
    pub fn new(
        repository: SagaRepository,
        engine: SagaEngine,
        executor: EffectExecutor,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            repository,
            engine,
            executor,
            max_conflict_retries,
        }
    }

    /// Builds a dispatcher whose four stores live in one backend.
    pub fn with_store<S>(store: S, bus: Arc<dyn MessageBus>, settings: &SagaSettings) -> Self
    where
        S: CorrelationStore + OutboxStore + TimeoutStore + DeadLetterStore + Clone + 'static,
    {
        let scheduler = TimeoutScheduler::new(Arc::new(store.clone()));
        let executor = EffectExecutor::new(
            bus,
            scheduler,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            settings.effect_retry,
        );
        Self::new(
            SagaRepository::new(Arc::new(store)),
            SagaEngine::new(settings),
            executor,
            settings.max_conflict_retries,
        )
    }

    pub fn scheduler(&self) -> &TimeoutScheduler {
        self.executor.scheduler()
    }

    pub fn executor(&self) -> &EffectExecutor {
        &self.executor
    }

    /// Dispatches one event to its saga instance.
    ///
    /// Returns `Ignored` for events the saga does not accept in its current
    /// state. Effects run only after the save succeeds; failing effects are
    /// dead-lettered and reported in the outcome. Ignored events still flush
    /// effects an earlier dispatch left in the outbox.
    #[tracing::instrument(skip_all, fields(correlation_id = %event.correlation_id(), message_type = event.message_type()))]
    pub async fn dispatch(&self, event: SagaEvent) -> Result<DispatchOutcome> {
        let started = Instant::now();
        let message_type = event.message_type();
        metrics::counter!("saga_messages_received_total", "type" => message_type).increment(1);

        let result = self.dispatch_inner(&event).await;

        metrics::histogram!("saga_dispatch_duration_seconds", "type" => message_type)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_inner(&self, event: &SagaEvent) -> Result<DispatchOutcome> {
        let correlation_id = event.correlation_id();
        let message_type = event.message_type();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let now = Utc::now();

            let instance = if matches!(event, SagaEvent::BookingRequested(_)) {
                self.repository.get_or_create(correlation_id, now).await?
            } else {
                match self.repository.load(correlation_id).await? {
                    Some(instance) => instance,
                    None => {
                        return Ok(self.ignore(correlation_id, message_type, Rejection::UnknownSaga));
                    }
                }
            };

            let mut transition = match self.engine.handle(&instance, event, now) {
                Ok(transition) => transition,
                Err(rejection) => {
                    self.flush_leftovers(correlation_id).await;
                    return Ok(self.ignore(correlation_id, message_type, rejection));
                }
            };

            let effects = Effect::plan(
                std::mem::take(&mut transition.timeouts),
                std::mem::take(&mut transition.commands),
            );
            match self.repository.save(&mut transition.instance, &effects).await {
                Ok(version) => {
                    for anomaly in &transition.anomalies {
                        tracing::warn!(%anomaly, "saga anomaly");
                    }
                    tracing::info!(
                        from = %transition.from,
                        to = %transition.to(),
                        %version,
                        "saga transitioned"
                    );
                    metrics::counter!(
                        "saga_transitions_total",
                        "from" => transition.from.as_str(),
                        "to" => transition.to().as_str()
                    )
                    .increment(1);

                    let to = transition.to();
                    let report = self.executor.flush(correlation_id).await?;

                    return Ok(DispatchOutcome::Applied(AppliedTransition {
                        correlation_id,
                        message_type,
                        from: transition.from,
                        to,
                        version,
                        attempts,
                        commands_published: report.published,
                        dead_letters: report.dead_letters,
                        pending_effects: report.pending,
                    }));
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!("saga_concurrency_conflicts_total").increment(1);
                    if attempts > self.max_conflict_retries {
                        metrics::counter!("saga_conflict_retries_exhausted_total").increment(1);
                        tracing::error!(attempts, error = %e, "concurrency retries exhausted");
                        return Err(SagaError::ConcurrencyRetriesExhausted {
                            correlation_id,
                            attempts,
                        });
                    }
                    tracing::debug!(attempts, "concurrency conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn flush_leftovers(&self, correlation_id: CorrelationId) {
        match self.executor.flush(correlation_id).await {
            Ok(report) if report.performed > 0 || !report.dead_letters.is_empty() => {
                tracing::info!(
                    performed = report.performed,
                    dead_letters = report.dead_letters.len(),
                    pending = report.pending,
                    "flushed effects left by an earlier dispatch"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "outbox flush failed"),
        }
    }

    fn ignore(
        &self,
        correlation_id: CorrelationId,
        message_type: &'static str,
        rejection: Rejection,
    ) -> DispatchOutcome {
        match &rejection {
            Rejection::Duplicate { .. } | Rejection::StaleTimeout { .. } => {
                tracing::debug!(reason = rejection.reason(), %rejection, "message ignored");
            }
            Rejection::Inconsistent { .. } => {
                tracing::error!(reason = rejection.reason(), %rejection, "message ignored");
            }
            _ => {
                tracing::warn!(reason = rejection.reason(), %rejection, "message ignored");
            }
        }
        metrics::counter!("saga_messages_ignored_total", "reason" => rejection.reason())
            .increment(1);
        DispatchOutcome::Ignored(IgnoredMessage {
            correlation_id,
            message_type,
            rejection,
        })
    }

    /// Loads a saga instance by correlation id.
    pub async fn get_saga(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>> {
        self.repository.load(correlation_id).await
    }

    /// Lists saga instances in `state`.
    pub async fn find_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>> {
        self.repository.find_by_state(state, limit).await
    }

    /// Lists timeouts still armed for a saga instance.
    pub async fn pending_timeouts(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<ScheduledTimeout>> {
        self.scheduler().pending_for(correlation_id).await
    }

    /// Lists dead letters, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.executor.list_dead_letters(limit).await
    }

    /// Retries a dead-lettered effect once. The letter is removed only if
    /// the retry succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn redrive_dead_letter(&self, id: DeadLetterId) -> Result<()> {
        let letter = self
            .executor
            .get_dead_letter(id)
            .await?
            .ok_or(SagaError::DeadLetterNotFound(id))?;

        let result = if letter.effect_kind == DELIVER_TIMEOUT_KIND {
            let event: SagaEvent = serde_json::from_value(letter.payload)?;
            self.dispatch(event).await.map(|_| ())
        } else {
            let effect: Effect = serde_json::from_value(letter.payload)?;
            self.executor.execute_once(&effect).await
        };

        match result {
            Ok(()) => {
                self.executor.remove_dead_letter(id).await?;
                tracing::info!(
                    correlation_id = %letter.correlation_id,
                    effect = %letter.effect_kind,
                    "dead letter redriven"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "dead letter redrive failed");
                Err(SagaError::RedriveFailed {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }
}
