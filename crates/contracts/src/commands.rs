//! Outbound commands emitted by the saga.

use common::{BookingId, CorrelationId, CraftspersonId, CustomerId, PaymentId};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::money::{Currency, Money};

/// Commands the saga sends to its collaborating services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaCommand {
    /// Ask the payment service to authorize the booking amount.
    InitiatePayment(InitiatePaymentCommand),

    /// Ask the booking service to confirm a paid booking.
    ConfirmBooking(ConfirmBookingCommand),

    /// Ask the booking service to cancel the booking (compensation).
    CancelBooking(CancelBookingCommand),

    /// Ask the payment service to refund a captured payment (compensation).
    InitiateRefund(InitiateRefundCommand),

    /// Ask the notification service to email the booking confirmation.
    SendBookingConfirmationNotification(SendBookingConfirmationNotificationCommand),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatePaymentCommand {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    pub recipient_id: CraftspersonId,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub currency: Currency,
    pub customer_email: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmBookingCommand {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    pub payment_id: PaymentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelBookingCommand {
    pub correlation_id: CorrelationId,
    pub booking_id: BookingId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiateRefundCommand {
    pub correlation_id: CorrelationId,
    pub payment_id: PaymentId,
    pub amount: Money,
    pub currency: Currency,
    pub recipient_email: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendBookingConfirmationNotificationCommand {
    pub correlation_id: CorrelationId,
    pub recipient_id: CustomerId,
    pub booking_id: BookingId,
    pub customer_email: String,
    pub amount: Money,
    pub currency: Currency,
    pub payment_reference: Option<String>,
}

impl Message for SagaCommand {
    fn message_type(&self) -> &'static str {
        match self {
            SagaCommand::InitiatePayment(_) => "InitiatePaymentCommand",
            SagaCommand::ConfirmBooking(_) => "ConfirmBookingCommand",
            SagaCommand::CancelBooking(_) => "CancelBookingCommand",
            SagaCommand::InitiateRefund(_) => "InitiateRefundCommand",
            SagaCommand::SendBookingConfirmationNotification(_) => {
                "SendBookingConfirmationNotificationCommand"
            }
        }
    }

    fn correlation_id(&self) -> CorrelationId {
        match self {
            SagaCommand::InitiatePayment(c) => c.correlation_id,
            SagaCommand::ConfirmBooking(c) => c.correlation_id,
            SagaCommand::CancelBooking(c) => c.correlation_id,
            SagaCommand::InitiateRefund(c) => c.correlation_id,
            SagaCommand::SendBookingConfirmationNotification(c) => c.correlation_id,
        }
    }
}
