//! Message contracts for the booking saga.
//!
//! The saga consumes [`SagaEvent`]s published by the booking, payment and
//! notification services and emits [`SagaCommand`]s back to them. Every
//! message carries the [`CorrelationId`](common::CorrelationId) of the saga
//! instance it belongs to.

pub mod commands;
pub mod error;
pub mod events;
pub mod message;
pub mod money;

pub use commands::{
    CancelBookingCommand, ConfirmBookingCommand, InitiatePaymentCommand, InitiateRefundCommand,
    SagaCommand, SendBookingConfirmationNotificationCommand,
};
pub use error::ContractError;
pub use events::{
    BookingCancelled, BookingConfirmationTimeoutExpired, BookingConfirmed, BookingRequested,
    NotificationSent, PaymentCompleted, PaymentFailed, PaymentInitiated, PaymentRefunded,
    PaymentTimeoutExpired, SagaEvent,
};
pub use message::Message;
pub use money::{Currency, Money};
