//! Inbound events consumed by the saga.

use chrono::{DateTime, Utc};
use common::{BookingId, CorrelationId, CraftspersonId, CustomerId, PaymentId, TimeoutTokenId};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::money::{Currency, Money};

/// Events that drive the booking saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// A customer requested a booking; starts a new saga instance.
    BookingRequested(BookingRequested),

    /// The payment service accepted the payment request.
    PaymentInitiated(PaymentInitiated),

    /// The payment was captured.
    PaymentCompleted(PaymentCompleted),

    /// The payment (or a refund) failed.
    PaymentFailed(PaymentFailed),

    /// The payment did not complete in time.
    PaymentTimeoutExpired(PaymentTimeoutExpired),

    /// The booking service confirmed the booking.
    BookingConfirmed(BookingConfirmed),

    /// The booking service did not confirm in time.
    BookingConfirmationTimeoutExpired(BookingConfirmationTimeoutExpired),

    /// The booking service cancelled the booking.
    BookingCancelled(BookingCancelled),

    /// The payment was refunded.
    PaymentRefunded(PaymentRefunded),

    /// The confirmation notification was delivered to the customer.
    NotificationSent(NotificationSent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequested {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    pub customer_id: CustomerId,
    pub craftsperson_id: CraftspersonId,
    pub amount: Money,
    pub currency: Currency,
    pub customer_email: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInitiated {
    pub correlation_id: CorrelationId,
    pub payment_id: PaymentId,
    pub amount: Money,
    #[serde(default)]
    pub payer_id: Option<CustomerId>,
    #[serde(default)]
    pub recipient_id: Option<CraftspersonId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub correlation_id: CorrelationId,
    /// Gateway reference shown to the customer.
    #[serde(default)]
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub correlation_id: CorrelationId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTimeoutExpired {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    pub payment_id: PaymentId,
    /// Token of the timeout that fired.
    pub token_id: TimeoutTokenId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub correlation_id: CorrelationId,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmationTimeoutExpired {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    /// Token of the timeout that fired.
    pub token_id: TimeoutTokenId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCancelled {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefunded {
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSent {
    pub correlation_id: CorrelationId,
}

impl SagaEvent {
    /// Returns the timeout token carried by timeout events.
    pub fn timeout_token(&self) -> Option<TimeoutTokenId> {
        match self {
            SagaEvent::PaymentTimeoutExpired(e) => Some(e.token_id),
            SagaEvent::BookingConfirmationTimeoutExpired(e) => Some(e.token_id),
            _ => None,
        }
    }

    /// Returns true for events produced by the timeout scheduler.
    pub fn is_timeout(&self) -> bool {
        self.timeout_token().is_some()
    }
}

impl Message for SagaEvent {
    fn message_type(&self) -> &'static str {
        match self {
            SagaEvent::BookingRequested(_) => "BookingRequested",
            SagaEvent::PaymentInitiated(_) => "PaymentInitiated",
            SagaEvent::PaymentCompleted(_) => "PaymentCompleted",
            SagaEvent::PaymentFailed(_) => "PaymentFailed",
            SagaEvent::PaymentTimeoutExpired(_) => "PaymentTimeoutExpired",
            SagaEvent::BookingConfirmed(_) => "BookingConfirmed",
            SagaEvent::BookingConfirmationTimeoutExpired(_) => "BookingConfirmationTimeoutExpired",
            SagaEvent::BookingCancelled(_) => "BookingCancelled",
            SagaEvent::PaymentRefunded(_) => "PaymentRefunded",
            SagaEvent::NotificationSent(_) => "NotificationSent",
        }
    }

    fn correlation_id(&self) -> CorrelationId {
        match self {
            SagaEvent::BookingRequested(e) => e.correlation_id,
            SagaEvent::PaymentInitiated(e) => e.correlation_id,
            SagaEvent::PaymentCompleted(e) => e.correlation_id,
            SagaEvent::PaymentFailed(e) => e.correlation_id,
            SagaEvent::PaymentTimeoutExpired(e) => e.correlation_id,
            SagaEvent::BookingConfirmed(e) => e.correlation_id,
            SagaEvent::BookingConfirmationTimeoutExpired(e) => e.correlation_id,
            SagaEvent::BookingCancelled(e) => e.correlation_id,
            SagaEvent::PaymentRefunded(e) => e.correlation_id,
            SagaEvent::NotificationSent(e) => e.correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_requested(correlation_id: CorrelationId) -> SagaEvent {
        SagaEvent::BookingRequested(BookingRequested {
            correlation_id,
            booking_id: BookingId::new(),
            customer_id: CustomerId::new(),
            craftsperson_id: CraftspersonId::new(),
            amount: Money::from_cents(15000),
            currency: Currency::new("EUR").unwrap(),
            customer_email: "ada@example.com".to_string(),
            description: "Kitchen tiling".to_string(),
        })
    }

    #[test]
    fn test_message_type_and_correlation() {
        let correlation_id = CorrelationId::new();
        let event = booking_requested(correlation_id);
        assert_eq!(event.message_type(), "BookingRequested");
        assert_eq!(event.correlation_id(), correlation_id);

        let event = SagaEvent::PaymentRefunded(PaymentRefunded { correlation_id });
        assert_eq!(event.message_type(), "PaymentRefunded");
        assert_eq!(event.correlation_id(), correlation_id);
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let correlation_id = CorrelationId::new();
        let event = SagaEvent::PaymentFailed(PaymentFailed {
            correlation_id,
            reason: "card declined".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PaymentFailed");
        assert_eq!(json["data"]["reason"], "card declined");
        assert_eq!(json["data"]["correlation_id"], correlation_id.to_string());
    }

    #[test]
    fn test_optional_fields_default_when_absent() {
        let correlation_id = CorrelationId::new();
        let json = serde_json::json!({
            "type": "PaymentCompleted",
            "data": { "correlation_id": correlation_id.to_string() }
        });

        let event: SagaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(
            event,
            SagaEvent::PaymentCompleted(PaymentCompleted {
                correlation_id,
                payment_reference: None,
            })
        );
    }

    #[test]
    fn test_timeout_token() {
        let correlation_id = CorrelationId::new();
        let token_id = TimeoutTokenId::new();
        let event = SagaEvent::BookingConfirmationTimeoutExpired(
            BookingConfirmationTimeoutExpired {
                correlation_id,
                booking_id: BookingId::new(),
                token_id,
            },
        );
        assert!(event.is_timeout());
        assert_eq!(event.timeout_token(), Some(token_id));
        assert!(!booking_requested(correlation_id).is_timeout());
    }
}
