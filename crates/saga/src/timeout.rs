//! Durable timeout scheduling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CorrelationId, TimeoutTokenId};
use contracts::SagaEvent;
use saga_store::{ScheduledTimeout, TimeoutStore};
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// Kinds of timeout a booking saga arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Payment must complete after being initiated.
    Payment,
    /// Booking must be confirmed after payment completed.
    BookingConfirmation,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Payment => "payment",
            TimeoutKind::BookingConfirmation => "booking_confirmation",
        }
    }

    /// Returns the kind of timeout an event reports, if it is a timeout event.
    pub fn of_event(event: &SagaEvent) -> Option<Self> {
        match event {
            SagaEvent::PaymentTimeoutExpired(_) => Some(TimeoutKind::Payment),
            SagaEvent::BookingConfirmationTimeoutExpired(_) => {
                Some(TimeoutKind::BookingConfirmation)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to deliver `event` at `deadline` unless cancelled first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutRequest {
    pub token_id: TimeoutTokenId,
    pub correlation_id: CorrelationId,
    pub kind: TimeoutKind,
    pub deadline: DateTime<Utc>,
    pub event: SagaEvent,
}

impl TimeoutRequest {
    /// Builds a request firing `delay` after `now`.
    pub fn after(
        token_id: TimeoutTokenId,
        correlation_id: CorrelationId,
        kind: TimeoutKind,
        now: DateTime<Utc>,
        delay: Duration,
        event: SagaEvent,
    ) -> Self {
        Self {
            token_id,
            correlation_id,
            kind,
            deadline: deadline_after(now, delay),
            event,
        }
    }
}

/// Timeout (de)registration produced by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOp {
    Cancel {
        kind: TimeoutKind,
        token_id: TimeoutTokenId,
    },
    Schedule(TimeoutRequest),
}

/// Returns `now + delay`, saturating instead of overflowing.
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A timeout handed out by the store once its deadline passed.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTimeout {
    pub token_id: TimeoutTokenId,
    pub correlation_id: CorrelationId,
    pub kind: String,
    pub deadline: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl FiredTimeout {
    /// Decodes the event to deliver.
    pub fn event(&self) -> Result<SagaEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

impl From<ScheduledTimeout> for FiredTimeout {
    fn from(t: ScheduledTimeout) -> Self {
        Self {
            token_id: t.token_id,
            correlation_id: t.correlation_id,
            kind: t.kind,
            deadline: t.deadline,
            payload: t.payload,
        }
    }
}

/// Schedules and cancels timeouts in a durable [`TimeoutStore`].
///
/// Timeouts survive process restarts: the scheduler holds no timers of its
/// own, a [`TimeoutPoller`](crate::poller::TimeoutPoller) claims due entries.
#[derive(Clone)]
pub struct TimeoutScheduler {
    store: Arc<dyn TimeoutStore>,
}

impl TimeoutScheduler {
    pub fn new(store: Arc<dyn TimeoutStore>) -> Self {
        Self { store }
    }

    /// Stores the timeout and returns its token.
    #[tracing::instrument(skip(self, request), fields(correlation_id = %request.correlation_id, kind = %request.kind, token_id = %request.token_id))]
    pub async fn schedule(&self, request: &TimeoutRequest) -> Result<TimeoutTokenId, SagaError> {
        let timeout = ScheduledTimeout {
            token_id: request.token_id,
            correlation_id: request.correlation_id,
            kind: request.kind.as_str().to_string(),
            deadline: request.deadline,
            payload: serde_json::to_value(&request.event)?,
            scheduled_at: Utc::now(),
            claimed_until: None,
        };
        self.store.schedule(timeout).await?;
        tracing::debug!(deadline = %request.deadline, "timeout scheduled");
        Ok(request.token_id)
    }

    /// Cancels a pending timeout.
    ///
    /// Returns false if the timeout already fired or was cancelled, which
    /// callers treat as success.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, token_id: TimeoutTokenId) -> Result<bool, SagaError> {
        let cancelled = self.store.cancel(token_id).await?;
        tracing::debug!(cancelled, "timeout cancel requested");
        Ok(cancelled)
    }

    /// Leases up to `limit` timeouts due at `now` for `lease`.
    ///
    /// A claimed timeout that is neither completed nor re-armed before the
    /// lease runs out is handed out again.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<FiredTimeout>, SagaError> {
        let lease_until = deadline_after(now, lease);
        let claimed = self.store.claim_due(now, lease_until, limit).await?;
        Ok(claimed.into_iter().map(FiredTimeout::from).collect())
    }

    /// Removes a timeout whose event was delivered.
    pub async fn complete(&self, fired: &FiredTimeout) -> Result<(), SagaError> {
        self.store.cancel(fired.token_id).await?;
        Ok(())
    }

    /// Drops the lease on a fired timeout so it is redelivered at `now`.
    ///
    /// Returns false if the timeout was cancelled in the meantime.
    pub async fn rearm(&self, fired: &FiredTimeout, now: DateTime<Utc>) -> Result<bool, SagaError> {
        Ok(self.store.release(fired.token_id, now).await?)
    }

    /// Lists timeouts still pending for a saga instance.
    pub async fn pending_for(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<ScheduledTimeout>, SagaError> {
        Ok(self.store.pending_for(correlation_id).await?)
    }
}
