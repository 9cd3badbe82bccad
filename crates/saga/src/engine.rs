//! Pure booking saga state machine.
//!
//! [`SagaEngine::handle`] maps `(instance, event, now)` to the next instance
//! plus the commands to publish and the timeouts to (de)register. It performs
//! no I/O; the dispatcher persists the result and then executes the effects.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{BookingId, PaymentId, TimeoutTokenId};
use contracts::{
    BookingCancelled, BookingConfirmationTimeoutExpired, BookingConfirmed, BookingRequested,
    CancelBookingCommand, ConfirmBookingCommand, InitiatePaymentCommand, InitiateRefundCommand,
    Message, Money, PaymentCompleted, PaymentFailed, PaymentInitiated, PaymentTimeoutExpired,
    SagaCommand, SagaEvent, SendBookingConfirmationNotificationCommand,
};
use thiserror::Error;

use crate::instance::{BookingSnapshot, SagaInstance};
use crate::settings::SagaSettings;
use crate::state::SagaState;
use crate::timeout::{TimeoutKind, TimeoutOp, TimeoutRequest};

/// Result of applying an event to a saga instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State before the event.
    pub from: SagaState,
    /// Instance after the event. Still carries the pre-save version.
    pub instance: SagaInstance,
    /// Commands to publish once the instance is saved, in order.
    pub commands: Vec<SagaCommand>,
    /// Timeouts to cancel or schedule once the instance is saved.
    pub timeouts: Vec<TimeoutOp>,
    /// Non-fatal oddities noticed while applying the event.
    pub anomalies: Vec<Anomaly>,
}

impl Transition {
    pub fn to(&self) -> SagaState {
        self.instance.state()
    }
}

/// Why an event was not applied. The instance is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// No saga exists for the event and the event does not start one.
    #[error("no saga exists for this correlation id")]
    UnknownSaga,

    #[error("saga already closed in state {state}")]
    Terminal { state: SagaState },

    #[error("{message_type} was already applied")]
    Duplicate { message_type: &'static str },

    /// Timeout whose token is not the one currently armed for its kind.
    #[error("stale {kind} timeout {token_id}")]
    StaleTimeout {
        kind: TimeoutKind,
        token_id: TimeoutTokenId,
    },

    #[error("{message_type} is not handled in state {state}")]
    Unhandled {
        state: SagaState,
        message_type: &'static str,
    },

    /// Stored instance lacks data its state implies.
    #[error("saga in state {state} has no {missing}")]
    Inconsistent {
        state: SagaState,
        missing: &'static str,
    },
}

impl Rejection {
    /// Short label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::UnknownSaga => "unknown_saga",
            Rejection::Terminal { .. } => "terminal",
            Rejection::Duplicate { .. } => "duplicate",
            Rejection::StaleTimeout { .. } => "stale_timeout",
            Rejection::Unhandled { .. } => "unhandled",
            Rejection::Inconsistent { .. } => "inconsistent",
        }
    }
}

/// Non-fatal oddity reported alongside a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// `PaymentInitiated` reported a different amount than was requested.
    /// The requested amount is kept.
    AmountMismatch { expected: Money, reported: Money },
    /// `BookingCancelled` named a different booking than the saga's.
    BookingMismatch {
        expected: BookingId,
        reported: BookingId,
    },
    /// The refund failed; the booking is cancelled anyway.
    RefundFailed { reason: String },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::AmountMismatch { expected, reported } => {
                write!(f, "payment amount {reported} differs from requested {expected}")
            }
            Anomaly::BookingMismatch { expected, reported } => {
                write!(f, "cancelled booking {reported} differs from saga booking {expected}")
            }
            Anomaly::RefundFailed { reason } => write!(f, "refund failed: {reason}"),
        }
    }
}

/// Stateless booking saga state machine.
#[derive(Debug, Clone)]
pub struct SagaEngine {
    payment_timeout: Duration,
    booking_confirmation_timeout: Duration,
    max_booking_confirmation_retries: u32,
}

impl Default for SagaEngine {
    fn default() -> Self {
        Self::new(&SagaSettings::default())
    }
}

impl SagaEngine {
    pub fn new(settings: &SagaSettings) -> Self {
        Self {
            payment_timeout: settings.payment_timeout,
            booking_confirmation_timeout: settings.booking_confirmation_timeout,
            max_booking_confirmation_retries: settings.max_booking_confirmation_retries,
        }
    }

    /// Applies `event` to `instance`.
    pub fn handle(
        &self,
        instance: &SagaInstance,
        event: &SagaEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, Rejection> {
        let state = instance.state();
        if state.is_terminal() {
            return Err(Rejection::Terminal { state });
        }

        if let (Some(kind), Some(token_id)) = (TimeoutKind::of_event(event), event.timeout_token())
            && instance.timeout_token(kind) != Some(token_id)
        {
            return Err(Rejection::StaleTimeout { kind, token_id });
        }

        let mut step = Step::new(instance, now);
        match (state, event) {
            (SagaState::Initial, SagaEvent::BookingRequested(e)) => {
                self.on_booking_requested(&mut step, e)
            }
            (SagaState::WaitingForPaymentInitiation, SagaEvent::PaymentInitiated(e)) => {
                self.on_payment_initiated(&mut step, e)?
            }
            (SagaState::WaitingForPaymentInitiation, SagaEvent::PaymentFailed(e)) => {
                step.compensate_booking(format!("payment failed: {}", e.reason))?
            }
            (SagaState::WaitingForPaymentCompletion, SagaEvent::PaymentCompleted(e)) => {
                self.on_payment_completed(&mut step, e)?
            }
            (SagaState::WaitingForPaymentCompletion, SagaEvent::PaymentFailed(e)) => {
                step.compensate_booking(format!("payment failed: {}", e.reason))?
            }
            (SagaState::WaitingForPaymentCompletion, SagaEvent::PaymentTimeoutExpired(e)) => {
                self.on_payment_timeout(&mut step, e)?
            }
            (SagaState::WaitingForBookingConfirmation, SagaEvent::BookingConfirmed(e)) => {
                self.on_booking_confirmed(&mut step, e)?
            }
            (
                SagaState::WaitingForBookingConfirmation,
                SagaEvent::BookingConfirmationTimeoutExpired(e),
            ) => self.on_confirmation_timeout(&mut step, e)?,
            (SagaState::WaitingForNotification, SagaEvent::NotificationSent(_)) => {
                step.next.completed_at = Some(now);
                step.go(SagaState::Completed);
            }
            (SagaState::CompensatingBooking, SagaEvent::BookingCancelled(e)) => {
                self.on_booking_cancelled(&mut step, e)?
            }
            (SagaState::CompensatingPayment, SagaEvent::PaymentRefunded(_)) => {
                let reason = step
                    .next
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "payment refunded".to_string());
                step.cancel_booking(reason)?
            }
            (SagaState::CompensatingPayment, SagaEvent::PaymentFailed(e)) => {
                self.on_refund_failed(&mut step, e)?
            }
            _ if instance.has_handled(event.message_type()) => {
                return Err(Rejection::Duplicate {
                    message_type: event.message_type(),
                });
            }
            _ => {
                return Err(Rejection::Unhandled {
                    state,
                    message_type: event.message_type(),
                });
            }
        }

        Ok(step.finish(event.message_type()))
    }

    fn on_booking_requested(&self, step: &mut Step, e: &BookingRequested) {
        step.emit(SagaCommand::InitiatePayment(InitiatePaymentCommand {
            correlation_id: e.correlation_id,
            booking_id: e.booking_id,
            recipient_id: e.craftsperson_id,
            customer_id: e.customer_id,
            amount: e.amount,
            currency: e.currency.clone(),
            customer_email: e.customer_email.clone(),
            description: e.description.clone(),
        }));
        step.next.booking = Some(BookingSnapshot {
            booking_id: e.booking_id,
            customer_id: e.customer_id,
            craftsperson_id: e.craftsperson_id,
            amount: e.amount,
            currency: e.currency.clone(),
            customer_email: e.customer_email.clone(),
            service_description: e.description.clone(),
        });
        step.go(SagaState::WaitingForPaymentInitiation);
    }

    fn on_payment_initiated(&self, step: &mut Step, e: &PaymentInitiated) -> Result<(), Rejection> {
        let booking = step.booking()?;
        if e.amount != booking.amount {
            step.anomalies.push(Anomaly::AmountMismatch {
                expected: booking.amount,
                reported: e.amount,
            });
        }

        step.next.payment_id = Some(e.payment_id);
        step.next.payment_initiated_at = Some(step.now);

        let correlation_id = step.next.correlation_id;
        let payment_id = e.payment_id;
        step.arm(TimeoutKind::Payment, self.payment_timeout, |token_id| {
            SagaEvent::PaymentTimeoutExpired(PaymentTimeoutExpired {
                correlation_id,
                booking_id: booking.booking_id,
                payment_id,
                token_id,
            })
        });
        step.go(SagaState::WaitingForPaymentCompletion);
        Ok(())
    }

    fn on_payment_completed(&self, step: &mut Step, e: &PaymentCompleted) -> Result<(), Rejection> {
        let booking = step.booking()?;
        let payment_id = step.payment_id()?;

        step.next.payment_completed_at = Some(step.now);
        step.next.payment_reference = e.payment_reference.clone();
        step.disarm(TimeoutKind::Payment);
        self.request_confirmation(step, booking.booking_id, payment_id);
        step.go(SagaState::WaitingForBookingConfirmation);
        Ok(())
    }

    fn on_payment_timeout(
        &self,
        step: &mut Step,
        _e: &PaymentTimeoutExpired,
    ) -> Result<(), Rejection> {
        step.compensate_booking(format!(
            "payment not completed within {}s",
            self.payment_timeout.as_secs()
        ))
    }

    fn on_booking_confirmed(&self, step: &mut Step, e: &BookingConfirmed) -> Result<(), Rejection> {
        let booking = step.booking()?;

        step.next.booking_confirmed_at = Some(e.confirmed_at);
        step.disarm(TimeoutKind::BookingConfirmation);
        let command = SendBookingConfirmationNotificationCommand {
            correlation_id: step.next.correlation_id,
            recipient_id: booking.customer_id,
            booking_id: booking.booking_id,
            customer_email: booking.customer_email,
            amount: booking.amount,
            currency: booking.currency,
            payment_reference: step.next.payment_reference.clone(),
        };
        step.emit(SagaCommand::SendBookingConfirmationNotification(command));
        step.go(SagaState::WaitingForNotification);
        Ok(())
    }

    fn on_confirmation_timeout(
        &self,
        step: &mut Step,
        _e: &BookingConfirmationTimeoutExpired,
    ) -> Result<(), Rejection> {
        let booking = step.booking()?;
        let payment_id = step.payment_id()?;

        let retries = step.next.booking_confirmation_retry_count.saturating_add(1);
        step.next.booking_confirmation_retry_count = retries;
        step.fired(TimeoutKind::BookingConfirmation);

        if retries <= self.max_booking_confirmation_retries {
            self.request_confirmation(step, booking.booking_id, payment_id);
            return Ok(());
        }

        let reason = format!(
            "booking not confirmed within {}s",
            self.booking_confirmation_timeout.as_secs()
        );
        step.next.failure_reason = Some(reason.clone());
        step.disarm_all();
        let command = InitiateRefundCommand {
            correlation_id: step.next.correlation_id,
            payment_id,
            amount: booking.amount,
            currency: booking.currency,
            recipient_email: booking.customer_email,
            reason,
        };
        step.emit(SagaCommand::InitiateRefund(command));
        step.go(SagaState::CompensatingPayment);
        Ok(())
    }

    fn on_booking_cancelled(&self, step: &mut Step, e: &BookingCancelled) -> Result<(), Rejection> {
        let booking = step.booking()?;
        if e.booking_id != booking.booking_id {
            step.anomalies.push(Anomaly::BookingMismatch {
                expected: booking.booking_id,
                reported: e.booking_id,
            });
        }

        step.next.cancelled_at = Some(step.now);
        step.next.completed_at = Some(step.now);
        step.disarm_all();
        step.go(SagaState::CompensatedAndClosed);
        Ok(())
    }

    fn on_refund_failed(&self, step: &mut Step, e: &PaymentFailed) -> Result<(), Rejection> {
        step.anomalies.push(Anomaly::RefundFailed {
            reason: e.reason.clone(),
        });
        let reason = step
            .next
            .failure_reason
            .clone()
            .unwrap_or_else(|| format!("refund failed: {}", e.reason));
        step.cancel_booking(reason)
    }

    /// Emits `ConfirmBooking` and arms the confirmation timeout.
    fn request_confirmation(&self, step: &mut Step, booking_id: BookingId, payment_id: PaymentId) {
        let correlation_id = step.next.correlation_id;
        step.arm(
            TimeoutKind::BookingConfirmation,
            self.booking_confirmation_timeout,
            |token_id| {
                SagaEvent::BookingConfirmationTimeoutExpired(BookingConfirmationTimeoutExpired {
                    correlation_id,
                    booking_id,
                    token_id,
                })
            },
        );
        step.emit(SagaCommand::ConfirmBooking(ConfirmBookingCommand {
            correlation_id,
            booking_id,
            payment_id,
        }));
    }
}

/// Accumulates one transition.
struct Step {
    from: SagaState,
    base_version: i64,
    now: DateTime<Utc>,
    next: SagaInstance,
    commands: Vec<SagaCommand>,
    timeouts: Vec<TimeoutOp>,
    anomalies: Vec<Anomaly>,
}

impl Step {
    fn new(instance: &SagaInstance, now: DateTime<Utc>) -> Self {
        Self {
            from: instance.state(),
            base_version: instance.version().as_i64(),
            now,
            next: instance.clone(),
            commands: Vec::new(),
            timeouts: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    fn booking(&self) -> Result<BookingSnapshot, Rejection> {
        self.next.booking.clone().ok_or(Rejection::Inconsistent {
            state: self.from,
            missing: "booking snapshot",
        })
    }

    fn payment_id(&self) -> Result<PaymentId, Rejection> {
        self.next.payment_id.ok_or(Rejection::Inconsistent {
            state: self.from,
            missing: "payment id",
        })
    }

    fn go(&mut self, state: SagaState) {
        self.next.state = state;
    }

    fn emit(&mut self, command: SagaCommand) {
        self.commands.push(command);
    }

    /// Arms a timeout of `kind`, cancelling any pending one of the same kind.
    ///
    /// The token is derived from the version being replaced, so re-running
    /// the engine on the same stored instance yields the same token.
    fn arm(
        &mut self,
        kind: TimeoutKind,
        delay: Duration,
        event: impl FnOnce(TimeoutTokenId) -> SagaEvent,
    ) {
        self.disarm(kind);
        let correlation_id = self.next.correlation_id;
        let token_id = TimeoutTokenId::derive(correlation_id, kind.as_str(), self.base_version);
        self.timeouts.push(TimeoutOp::Schedule(TimeoutRequest::after(
            token_id,
            correlation_id,
            kind,
            self.now,
            delay,
            event(token_id),
        )));
        *self.next.timeout_token_mut(kind) = Some(token_id);
    }

    fn disarm(&mut self, kind: TimeoutKind) {
        if let Some(token_id) = self.next.timeout_token_mut(kind).take() {
            self.timeouts.push(TimeoutOp::Cancel { kind, token_id });
        }
    }

    fn disarm_all(&mut self) {
        self.disarm(TimeoutKind::Payment);
        self.disarm(TimeoutKind::BookingConfirmation);
    }

    /// Forgets a timeout that has just fired.
    fn fired(&mut self, kind: TimeoutKind) {
        *self.next.timeout_token_mut(kind) = None;
    }

    /// Records the failure and starts cancelling the booking.
    fn compensate_booking(&mut self, reason: String) -> Result<(), Rejection> {
        self.next.failure_reason = Some(reason.clone());
        self.cancel_booking(reason)
    }

    fn cancel_booking(&mut self, reason: String) -> Result<(), Rejection> {
        let booking = self.booking()?;
        self.disarm_all();
        let command = CancelBookingCommand {
            correlation_id: self.next.correlation_id,
            booking_id: booking.booking_id,
            reason,
        };
        self.emit(SagaCommand::CancelBooking(command));
        self.go(SagaState::CompensatingBooking);
        Ok(())
    }

    fn finish(mut self, message_type: &str) -> Transition {
        self.next.updated_at = self.now;
        self.next.handled_messages.insert(message_type.to_string());
        Transition {
            from: self.from,
            instance: self.next,
            commands: self.commands,
            timeouts: self.timeouts,
            anomalies: self.anomalies,
        }
    }
}
