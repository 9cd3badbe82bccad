//! Booking saga state machine states.

use serde::{Deserialize, Serialize};

/// The state of a booking saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Initial ──► WaitingForPaymentInitiation ──► WaitingForPaymentCompletion
///                     │                               │
///                     │                               ▼
///                     │                  WaitingForBookingConfirmation ──► WaitingForNotification ──► Completed
///                     │                               │
///                     ▼                               ▼
///             CompensatingBooking ◄──────── CompensatingPayment
///                     │
///                     ▼
///            CompensatedAndClosed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Instance exists but has not processed `BookingRequested` yet.
    #[default]
    Initial,

    /// Payment was requested; waiting for the payment service to accept it.
    WaitingForPaymentInitiation,

    /// Payment was accepted; waiting for capture. The payment timeout is armed.
    WaitingForPaymentCompletion,

    /// Payment captured; waiting for the booking service. The confirmation
    /// timeout is armed.
    WaitingForBookingConfirmation,

    /// Booking confirmed; waiting for the customer notification.
    WaitingForNotification,

    /// Refund requested after the booking could not be confirmed.
    CompensatingPayment,

    /// Booking cancellation requested.
    CompensatingBooking,

    /// Booking confirmed and customer notified (terminal state).
    Completed,

    /// Compensation finished after a failure (terminal state).
    CompensatedAndClosed,
}

impl SagaState {
    /// All states, in lifecycle order.
    pub const ALL: [SagaState; 9] = [
        SagaState::Initial,
        SagaState::WaitingForPaymentInitiation,
        SagaState::WaitingForPaymentCompletion,
        SagaState::WaitingForBookingConfirmation,
        SagaState::WaitingForNotification,
        SagaState::CompensatingPayment,
        SagaState::CompensatingBooking,
        SagaState::Completed,
        SagaState::CompensatedAndClosed,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::CompensatedAndClosed)
    }

    /// Returns true if the saga is undoing completed steps.
    pub fn is_compensating(&self) -> bool {
        matches!(
            self,
            SagaState::CompensatingPayment | SagaState::CompensatingBooking
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Initial => "Initial",
            SagaState::WaitingForPaymentInitiation => "WaitingForPaymentInitiation",
            SagaState::WaitingForPaymentCompletion => "WaitingForPaymentCompletion",
            SagaState::WaitingForBookingConfirmation => "WaitingForBookingConfirmation",
            SagaState::WaitingForNotification => "WaitingForNotification",
            SagaState::CompensatingPayment => "CompensatingPayment",
            SagaState::CompensatingBooking => "CompensatingBooking",
            SagaState::Completed => "Completed",
            SagaState::CompensatedAndClosed => "CompensatedAndClosed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown saga state: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_initial() {
        assert_eq!(SagaState::default(), SagaState::Initial);
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = SagaState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![SagaState::Completed, SagaState::CompensatedAndClosed]
        );
    }

    #[test]
    fn test_compensating_states() {
        assert!(SagaState::CompensatingPayment.is_compensating());
        assert!(SagaState::CompensatingBooking.is_compensating());
        assert!(!SagaState::WaitingForPaymentCompletion.is_compensating());
        assert!(!SagaState::CompensatedAndClosed.is_compensating());
    }

    #[test]
    fn test_display_and_parse() {
        for state in SagaState::ALL {
            let parsed: SagaState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("Running".parse::<SagaState>().is_err());
    }

    #[test]
    fn test_serialization() {
        let state = SagaState::WaitingForBookingConfirmation;
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"WaitingForBookingConfirmation\"");
    }
}
