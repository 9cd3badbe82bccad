//! Booking saga orchestration.
//!
//! A booking saga coordinates the booking, payment and notification services
//! through correlated messages:
//! 1. Request payment for the booking
//! 2. Confirm the booking once the payment completed
//! 3. Notify the customer
//!
//! Failures drive compensation: an unpaid booking is cancelled, and a paid
//! but unconfirmed booking is refunded and then cancelled.
//!
//! The [`SagaEngine`] is a pure state machine. The [`SagaDispatcher`] loads
//! the instance for each event, runs the engine, saves the result with
//! optimistic concurrency and only then executes the resulting effects.
//! Timeouts are durable entries claimed by a [`TimeoutPoller`].

pub mod bus;
pub mod dispatcher;
pub mod effects;
pub mod engine;
pub mod error;
pub mod instance;
pub mod poller;
pub mod repository;
pub mod settings;
pub mod state;
pub mod timeout;

pub use bus::{BusError, InMemoryMessageBus, MessageBus};
pub use dispatcher::{AppliedTransition, DispatchOutcome, IgnoredMessage, SagaDispatcher};
pub use effects::{Effect, EffectExecutor, EffectReport};
pub use engine::{Anomaly, Rejection, SagaEngine, Transition};
pub use error::SagaError;
pub use instance::{BookingSnapshot, SAGA_TYPE, SagaInstance};
pub use poller::{PollReport, TimeoutPoller};
pub use repository::SagaRepository;
pub use settings::{RetryPolicy, SagaSettings};
pub use state::SagaState;
pub use timeout::{FiredTimeout, TimeoutKind, TimeoutOp, TimeoutRequest, TimeoutScheduler};
