//! Tunables for the booking saga.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Exponential backoff policy for side effects executed after a save.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Builds the backoff schedule: one delay per retry after the first
    /// attempt, growing by `multiplier` and capped at `max_backoff`.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier.max(1) as f32)
            .with_max_times((self.attempts() - 1) as usize)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

/// Settings for the booking saga runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaSettings {
    /// How long a payment may stay initiated before it is abandoned.
    pub payment_timeout: Duration,
    /// How long the booking service has to confirm a paid booking.
    pub booking_confirmation_timeout: Duration,
    /// Extra `ConfirmBooking` attempts before refunding.
    pub max_booking_confirmation_retries: u32,
    /// Re-fetch and re-run attempts after losing a save race.
    pub max_conflict_retries: u32,
    /// Retry policy for publishes and timeout registration.
    pub effect_retry: RetryPolicy,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(15 * 60),
            booking_confirmation_timeout: Duration::from_secs(30),
            max_booking_confirmation_retries: 0,
            max_conflict_retries: 5,
            effect_retry: RetryPolicy::default(),
        }
    }
}
