//! Background delivery of due timeouts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::dispatcher::SagaDispatcher;
use crate::effects::DELIVER_TIMEOUT_KIND;
use crate::error::{Result, SagaError};
use crate::timeout::FiredTimeout;

/// How long a claimed timeout is reserved for the poller delivering it.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Age after which outbox entries are swept by the poller.
pub const DEFAULT_OUTBOX_GRACE: Duration = Duration::from_secs(30);

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Timeouts claimed from the store.
    pub claimed: usize,
    /// Timeouts delivered to the dispatcher, applied or ignored.
    pub delivered: usize,
    /// Timeouts put back for redelivery.
    pub rearmed: usize,
    /// Timeouts that cannot be delivered and were dead-lettered.
    pub dead_lettered: usize,
    /// Timeouts left leased after an error. They are claimed again once the
    /// lease expires.
    pub failed: usize,
    /// Sagas whose stale outbox entries were flushed.
    pub outbox_flushed: usize,
}

/// Claims due timeouts and feeds their events to the dispatcher.
///
/// A claim leases the timeout instead of removing it; the entry is deleted
/// only after its event was dispatched or dead-lettered. When delivery fails
/// with a transient error the lease is dropped for immediate redelivery, and
/// a poller that dies mid-batch leaves its leases to expire, so delivery is
/// at-least-once.
///
/// Each poll also flushes outbox entries older than the outbox grace, which
/// covers dispatches interrupted between their save and their effects.
pub struct TimeoutPoller {
    dispatcher: Arc<SagaDispatcher>,
    interval: Duration,
    batch_size: usize,
    lease: Duration,
    outbox_grace: Duration,
}

impl TimeoutPoller {
    pub fn new(dispatcher: Arc<SagaDispatcher>, interval: Duration, batch_size: usize) -> Self {
        Self {
            dispatcher,
            interval: interval.max(MIN_INTERVAL),
            batch_size: batch_size.max(1),
            lease: DEFAULT_LEASE,
            outbox_grace: DEFAULT_OUTBOX_GRACE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_outbox_grace(mut self, grace: Duration) -> Self {
        self.outbox_grace = grace;
        self
    }

    /// Polls until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            lease_ms = self.lease.as_millis() as u64,
            "timeout poller started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        tracing::error!(error = %e, "timeout poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("timeout poller stopped");
    }

    /// Flushes stale outbox entries, then delivers every timeout due at
    /// `now`, one batch at a time.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let mut report = PollReport::default();

        let older_than = chrono::Duration::from_std(self.outbox_grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self
            .dispatcher
            .executor()
            .flush_stale(older_than, self.batch_size)
            .await
        {
            Ok(flushed) => report.outbox_flushed = flushed,
            Err(e) => tracing::error!(error = %e, "outbox sweep failed"),
        }

        loop {
            let batch = self
                .dispatcher
                .scheduler()
                .claim_due(now, self.lease, self.batch_size)
                .await?;
            let batch_len = batch.len();
            report.claimed += batch_len;

            for fired in &batch {
                if let Err(e) = self.deliver(fired, now, &mut report).await {
                    tracing::error!(
                        correlation_id = %fired.correlation_id,
                        token_id = %fired.token_id,
                        error = %e,
                        "timeout left leased for a later poll"
                    );
                    report.failed += 1;
                }
            }
            // Re-armed entries are due at `now` again; stop rather than spin.
            if batch_len < self.batch_size || report.rearmed > 0 {
                break;
            }
        }
        Ok(report)
    }

    async fn deliver(
        &self,
        fired: &FiredTimeout,
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) -> Result<()> {
        let scheduler = self.dispatcher.scheduler();
        let event = match fired.event() {
            Ok(event) => event,
            Err(e) => {
                self.dead_letter(fired, &SagaError::from(e)).await?;
                scheduler.complete(fired).await?;
                report.dead_lettered += 1;
                return Ok(());
            }
        };

        match self.dispatcher.dispatch(event).await {
            Ok(_) => {
                scheduler.complete(fired).await?;
                metrics::counter!("saga_timeouts_fired_total", "kind" => fired.kind.clone())
                    .increment(1);
                report.delivered += 1;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    correlation_id = %fired.correlation_id,
                    token_id = %fired.token_id,
                    error = %e,
                    "timeout delivery failed, re-arming"
                );
                scheduler.rearm(fired, now).await?;
                report.rearmed += 1;
            }
            Err(e) => {
                self.dead_letter(fired, &e).await?;
                scheduler.complete(fired).await?;
                report.dead_lettered += 1;
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, fired: &FiredTimeout, error: &SagaError) -> Result<()> {
        self.dispatcher
            .executor()
            .dead_letter(
                fired.correlation_id,
                DELIVER_TIMEOUT_KIND,
                fired.payload.clone(),
                error,
                1,
            )
            .await?;
        Ok(())
    }
}
