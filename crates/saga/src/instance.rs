//! Booking saga instance.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::{BookingId, CorrelationId, CraftspersonId, CustomerId, PaymentId, TimeoutTokenId};
use contracts::{Currency, Money};
use saga_store::Version;
use serde::{Deserialize, Serialize};

use crate::state::SagaState;
use crate::timeout::TimeoutKind;

/// Saga type name under which instances are stored.
pub const SAGA_TYPE: &str = "BookingSaga";

/// Booking fields captured from `BookingRequested`.
///
/// Written once when the saga starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingSnapshot {
    pub booking_id: BookingId,
    pub customer_id: CustomerId,
    pub craftsperson_id: CraftspersonId,
    pub amount: Money,
    pub currency: Currency,
    pub customer_email: String,
    pub service_description: String,
}

/// One in-flight booking saga.
///
/// Tracks the current state, the business snapshot needed to build
/// outbound commands, and the tokens of any armed timeouts. Only the
/// engine mutates an instance; the dispatcher persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub(crate) correlation_id: CorrelationId,
    pub(crate) state: SagaState,
    #[serde(skip)]
    pub(crate) version: Version,
    pub(crate) booking: Option<BookingSnapshot>,
    pub(crate) payment_id: Option<PaymentId>,
    pub(crate) failure_reason: Option<String>,
    pub(crate) payment_reference: Option<String>,
    pub(crate) booking_confirmation_retry_count: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) payment_initiated_at: Option<DateTime<Utc>>,
    pub(crate) payment_completed_at: Option<DateTime<Utc>>,
    pub(crate) booking_confirmed_at: Option<DateTime<Utc>>,
    pub(crate) cancelled_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) payment_timeout_token: Option<TimeoutTokenId>,
    pub(crate) booking_confirmation_timeout_token: Option<TimeoutTokenId>,
    /// Message types already applied, for duplicate detection.
    #[serde(default)]
    pub(crate) handled_messages: BTreeSet<String>,
}

impl SagaInstance {
    /// Creates a fresh, unsaved instance in the `Initial` state.
    pub fn new(correlation_id: CorrelationId, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            state: SagaState::Initial,
            version: Version::initial(),
            booking: None,
            payment_id: None,
            failure_reason: None,
            payment_reference: None,
            booking_confirmation_retry_count: 0,
            created_at: now,
            updated_at: now,
            payment_initiated_at: None,
            payment_completed_at: None,
            booking_confirmed_at: None,
            cancelled_at: None,
            completed_at: None,
            payment_timeout_token: None,
            booking_confirmation_timeout_token: None,
            handled_messages: BTreeSet::new(),
        }
    }

    /// Sets the stored version. Called by the repository after load/save.
    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn timeout_token(&self, kind: TimeoutKind) -> Option<TimeoutTokenId> {
        match kind {
            TimeoutKind::Payment => self.payment_timeout_token,
            TimeoutKind::BookingConfirmation => self.booking_confirmation_timeout_token,
        }
    }

    pub(crate) fn timeout_token_mut(&mut self, kind: TimeoutKind) -> &mut Option<TimeoutTokenId> {
        match kind {
            TimeoutKind::Payment => &mut self.payment_timeout_token,
            TimeoutKind::BookingConfirmation => &mut self.booking_confirmation_timeout_token,
        }
    }
}

// Query methods
impl SagaInstance {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Returns the optimistic-concurrency version of the stored instance.
    ///
    /// An instance that has never been saved is at [`Version::initial`].
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns true once no further transitions are accepted.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns the booking snapshot, set once `BookingRequested` is applied.
    pub fn booking(&self) -> Option<&BookingSnapshot> {
        self.booking.as_ref()
    }

    pub fn booking_id(&self) -> Option<BookingId> {
        self.booking.as_ref().map(|b| b.booking_id)
    }

    pub fn amount(&self) -> Option<Money> {
        self.booking.as_ref().map(|b| b.amount)
    }

    pub fn currency(&self) -> Option<&Currency> {
        self.booking.as_ref().map(|b| &b.currency)
    }

    pub fn payment_id(&self) -> Option<PaymentId> {
        self.payment_id
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn payment_reference(&self) -> Option<&str> {
        self.payment_reference.as_deref()
    }

    pub fn booking_confirmation_retry_count(&self) -> u32 {
        self.booking_confirmation_retry_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn payment_initiated_at(&self) -> Option<DateTime<Utc>> {
        self.payment_initiated_at
    }

    pub fn payment_completed_at(&self) -> Option<DateTime<Utc>> {
        self.payment_completed_at
    }

    pub fn booking_confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.booking_confirmed_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn payment_timeout_token(&self) -> Option<TimeoutTokenId> {
        self.payment_timeout_token
    }

    pub fn booking_confirmation_timeout_token(&self) -> Option<TimeoutTokenId> {
        self.booking_confirmation_timeout_token
    }

    /// Returns true if a message of this type was already applied.
    pub fn has_handled(&self, message_type: &str) -> bool {
        self.handled_messages.contains(message_type)
    }
}
