//! Shared identifier types for the booking saga orchestrator.

pub mod ids;

pub use ids::{
    BookingId, CorrelationId, CraftspersonId, CustomerId, DeadLetterId, PaymentId, TimeoutTokenId,
};
