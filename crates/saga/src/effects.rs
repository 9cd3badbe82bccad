//! Side effects executed after a saga instance is saved.
//!
//! A transition's effects are written to the outbox in the same save as the
//! instance. [`EffectExecutor::flush`] then performs them and settles each
//! entry, so an interrupted dispatch leaves its effects pending instead of
//! dropping them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::Retryable;

use chrono::{DateTime, Utc};
use common::{CorrelationId, DeadLetterId, TimeoutTokenId};
use contracts::{Message, SagaCommand};
use saga_store::{DeadLetter, DeadLetterStore, OutboxEntry, OutboxStore, Version};
use serde::{Deserialize, Serialize};

use crate::bus::MessageBus;
use crate::error::{Result, SagaError};
use crate::settings::RetryPolicy;
use crate::timeout::{TimeoutKind, TimeoutOp, TimeoutRequest, TimeoutScheduler};

/// Dead letter kind for a timeout event whose delivery could not be retried.
pub const DELIVER_TIMEOUT_KIND: &str = "deliver_timeout";

/// One side effect of a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", content = "data", rename_all = "snake_case")]
pub enum Effect {
    CancelTimeout {
        kind: TimeoutKind,
        token_id: TimeoutTokenId,
    },
    ScheduleTimeout(TimeoutRequest),
    Publish(SagaCommand),
}

impl Effect {
    /// Label stored with dead letters and used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::CancelTimeout { .. } => "cancel_timeout",
            Effect::ScheduleTimeout(_) => "schedule_timeout",
            Effect::Publish(_) => "publish",
        }
    }

    /// Orders effects for execution: timeout cancels, then schedules, then
    /// publishes. Order within each group is kept.
    pub fn plan(timeouts: Vec<TimeoutOp>, commands: Vec<SagaCommand>) -> Vec<Effect> {
        let (cancels, schedules): (Vec<_>, Vec<_>) = timeouts
            .into_iter()
            .map(Effect::from)
            .partition(|e| matches!(e, Effect::CancelTimeout { .. }));
        cancels
            .into_iter()
            .chain(schedules)
            .chain(commands.into_iter().map(Effect::Publish))
            .collect()
    }

    /// Serializes planned effects as outbox entries numbered in plan order.
    ///
    /// The store stamps the entries with the version of the save.
    pub fn outbox_entries(
        correlation_id: CorrelationId,
        effects: &[Effect],
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>> {
        effects
            .iter()
            .enumerate()
            .map(|(seq, effect)| {
                Ok(OutboxEntry {
                    correlation_id,
                    version: Version::initial(),
                    seq: seq as u32,
                    effect_kind: effect.kind().to_string(),
                    payload: serde_json::to_value(effect)?,
                    created_at: now,
                })
            })
            .collect()
    }
}

impl From<TimeoutOp> for Effect {
    fn from(op: TimeoutOp) -> Self {
        match op {
            TimeoutOp::Cancel { kind, token_id } => Effect::CancelTimeout { kind, token_id },
            TimeoutOp::Schedule(request) => Effect::ScheduleTimeout(request),
        }
    }
}

/// Outcome of executing a transition's effects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectReport {
    /// Effects that succeeded.
    pub performed: usize,
    /// Commands that reached the bus.
    pub published: usize,
    /// Effects that exhausted their retries.
    pub dead_letters: Vec<DeadLetterId>,
    /// Outbox entries left for a later flush.
    pub pending: usize,
}

/// Executes outbox effects with retry, dead-lettering those that keep failing.
#[derive(Clone)]
pub struct EffectExecutor {
    bus: Arc<dyn MessageBus>,
    scheduler: TimeoutScheduler,
    dead_letters: Arc<dyn DeadLetterStore>,
    outbox: Arc<dyn OutboxStore>,
    retry: RetryPolicy,
}

impl EffectExecutor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        scheduler: TimeoutScheduler,
        dead_letters: Arc<dyn DeadLetterStore>,
        outbox: Arc<dyn OutboxStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            scheduler,
            dead_letters,
            outbox,
            retry,
        }
    }

    pub fn scheduler(&self) -> &TimeoutScheduler {
        &self.scheduler
    }

    /// Performs the pending outbox entries of a saga in order.
    ///
    /// An entry is settled once its effect succeeded or was dead-lettered.
    /// A failing effect does not stop the ones after it. If an effect can be
    /// neither performed nor dead-lettered, it and every later entry stay in
    /// the outbox for the next flush.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self, correlation_id: CorrelationId) -> Result<EffectReport> {
        let pending = self.outbox.pending_outbox(correlation_id).await?;
        let total = pending.len();
        let mut report = EffectReport::default();

        for (done, entry) in pending.into_iter().enumerate() {
            if let Err(e) = self.perform(&entry, &mut report).await {
                tracing::error!(
                    version = %entry.version,
                    seq = entry.seq,
                    effect = %entry.effect_kind,
                    error = %e,
                    "outbox entry left pending"
                );
                report.pending = total - done;
                break;
            }
            if let Err(e) = self
                .outbox
                .settle(correlation_id, entry.version, entry.seq)
                .await
            {
                tracing::warn!(
                    version = %entry.version,
                    seq = entry.seq,
                    error = %e,
                    "outbox entry performed but not settled, it will run again"
                );
            }
        }
        Ok(report)
    }

    /// Flushes up to `limit` sagas whose outbox holds entries created at or
    /// before `older_than`. Returns the number of sagas flushed.
    pub async fn flush_stale(&self, older_than: DateTime<Utc>, limit: usize) -> Result<usize> {
        let stale = self.outbox.stale_outbox(older_than, limit).await?;
        for correlation_id in &stale {
            match self.flush(*correlation_id).await {
                Ok(report) => tracing::info!(
                    %correlation_id,
                    performed = report.performed,
                    dead_letters = report.dead_letters.len(),
                    pending = report.pending,
                    "stale outbox flushed"
                ),
                Err(e) => tracing::warn!(%correlation_id, error = %e, "stale outbox flush failed"),
            }
        }
        Ok(stale.len())
    }

    async fn perform(&self, entry: &OutboxEntry, report: &mut EffectReport) -> Result<()> {
        let effect: Effect = match serde_json::from_value(entry.payload.clone()) {
            Ok(effect) => effect,
            Err(e) => {
                let id = self
                    .dead_letter(
                        entry.correlation_id,
                        &entry.effect_kind,
                        entry.payload.clone(),
                        &SagaError::from(e),
                        0,
                    )
                    .await?;
                report.dead_letters.push(id);
                return Ok(());
            }
        };

        match self.execute_with_retry(&effect).await {
            Ok(()) => {
                report.performed += 1;
                if matches!(effect, Effect::Publish(_)) {
                    report.published += 1;
                }
            }
            Err((error, attempts)) => {
                let id = self
                    .dead_letter(
                        entry.correlation_id,
                        effect.kind(),
                        entry.payload.clone(),
                        &error,
                        attempts,
                    )
                    .await?;
                report.dead_letters.push(id);
            }
        }
        Ok(())
    }

    /// Executes one effect once, without retry.
    pub async fn execute_once(&self, effect: &Effect) -> Result<()> {
        match effect {
            Effect::CancelTimeout { token_id, .. } => {
                self.scheduler.cancel(*token_id).await?;
            }
            Effect::ScheduleTimeout(request) => {
                self.scheduler.schedule(request).await?;
            }
            Effect::Publish(command) => {
                self.bus.publish(command).await?;
                metrics::counter!("saga_commands_published_total", "type" => command.message_type())
                    .increment(1);
            }
        }
        Ok(())
    }

    async fn execute_with_retry(&self, effect: &Effect) -> std::result::Result<(), (SagaError, u32)> {
        let attempts = AtomicU32::new(0);
        let result = (|| async {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.execute_once(effect).await
        })
        .retry(self.retry.backoff())
        .when(|e: &SagaError| e.is_transient())
        .notify(|e: &SagaError, delay: Duration| {
            tracing::warn!(
                effect = effect.kind(),
                attempt = attempts.load(Ordering::Relaxed),
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "effect failed, retrying"
            );
            metrics::counter!("saga_publish_retries_total", "effect" => effect.kind())
                .increment(1);
        })
        .await;

        result.map_err(|e| (e, attempts.load(Ordering::Relaxed)))
    }

    /// Stores a dead letter for an effect that could not be performed.
    pub async fn dead_letter(
        &self,
        correlation_id: CorrelationId,
        effect_kind: &str,
        payload: serde_json::Value,
        error: &SagaError,
        attempts: u32,
    ) -> Result<DeadLetterId> {
        let letter = DeadLetter {
            id: DeadLetterId::new(),
            correlation_id,
            effect_kind: effect_kind.to_string(),
            payload,
            last_error: error.to_string(),
            attempts,
            created_at: Utc::now(),
        };
        let id = letter.id;
        self.dead_letters.record(letter).await?;

        tracing::error!(
            %correlation_id,
            dead_letter_id = %id,
            effect = effect_kind,
            attempts,
            error = %error,
            "effect dead-lettered"
        );
        metrics::counter!("saga_dead_letters_total", "effect" => effect_kind.to_string())
            .increment(1);
        Ok(id)
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.list(limit).await?)
    }

    pub async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        Ok(self.dead_letters.get(id).await?)
    }

    pub async fn remove_dead_letter(&self, id: DeadLetterId) -> Result<bool> {
        Ok(self.dead_letters.remove(id).await?)
    }
}
