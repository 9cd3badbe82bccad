use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, DeadLetterId, TimeoutTokenId};

/// Version number of a saga record, used for optimistic concurrency control.
///
/// A record that has never been saved is at version 0; the first save
/// stores version 1 and every later save increments by 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of an unsaved record.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) of a freshly inserted record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Persisted form of one saga instance.
///
/// The store treats the instance body as opaque JSON; `status` and
/// `terminal` are lifted out so instances can be queried without decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// Identity of the saga instance.
    pub correlation_id: CorrelationId,

    /// The kind of saga (e.g., "BookingSaga").
    pub saga_type: String,

    /// Name of the current state.
    pub status: String,

    /// Whether the instance accepts no further transitions.
    pub terminal: bool,

    /// Version of the stored record.
    pub version: Version,

    /// The serialized instance.
    pub payload: serde_json::Value,

    /// When the instance was created.
    pub created_at: DateTime<Utc>,

    /// When the instance was last saved.
    pub updated_at: DateTime<Utc>,
}

/// A timeout waiting in the arena for its deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTimeout {
    /// Token used to cancel the timeout.
    pub token_id: TimeoutTokenId,

    /// Saga instance the timeout belongs to.
    pub correlation_id: CorrelationId,

    /// Kind of timeout (e.g., "payment").
    pub kind: String,

    /// When the timeout fires.
    pub deadline: DateTime<Utc>,

    /// The serialized event delivered when the timeout fires.
    pub payload: serde_json::Value,

    /// When the timeout was scheduled.
    pub scheduled_at: DateTime<Utc>,

    /// Lease held by the poller delivering the timeout, if any.
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
}

impl ScheduledTimeout {
    /// Returns true if the deadline has passed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }

    /// Returns true if the timeout is due and no live lease holds it.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.claimed_until.is_none_or(|until| until <= now)
    }
}

/// An effect planned by a saved transition and not yet performed.
///
/// Entries are written in the same atomic step as the saga record, so a
/// crash between the save and the effect leaves the effect here instead of
/// losing it. Within a saga, entries run in `(version, seq)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub correlation_id: CorrelationId,
    /// Version produced by the save that planned the effect.
    pub version: Version,
    /// Position of the effect within its transition.
    pub seq: u32,
    /// Kind of effect (e.g., "publish", "schedule_timeout").
    pub effect_kind: String,
    /// The serialized effect.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A side effect that could not be performed after retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub correlation_id: CorrelationId,
    /// Kind of effect (e.g., "publish", "schedule_timeout").
    pub effect_kind: String,
    /// The serialized effect, sufficient to perform it again.
    pub payload: serde_json::Value,
    pub last_error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
