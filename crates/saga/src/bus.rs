//! Outbound message bus trait and in-memory implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use contracts::{Message, SagaCommand};
use thiserror::Error;

/// Errors returned by a [`MessageBus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus could not be reached. Retrying may succeed.
    #[error("Message bus unavailable: {0}")]
    Unavailable(String),

    /// The bus refused the message. Retrying the same message will not help.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

/// Publishes saga commands to collaborating services.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes one command. At-least-once: callers may publish a command
    /// more than once.
    async fn publish(&self, command: &SagaCommand) -> Result<(), BusError>;
}

#[derive(Debug, Default)]
struct InMemoryBusState {
    published: Vec<SagaCommand>,
    fail_next: u32,
    unavailable: bool,
    rejecting: bool,
    hanging: bool,
}

/// In-memory message bus for testing.
///
/// Records every published command and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<RwLock<InMemoryBusState>>,
}

impl InMemoryMessageBus {
    /// Creates a new in-memory message bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail as unavailable.
    pub fn set_fail_next(&self, count: u32) {
        self.state.write().unwrap().fail_next = count;
    }

    /// Makes every publish fail as unavailable until switched off.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.write().unwrap().unavailable = unavailable;
    }

    /// Makes every publish fail as rejected until switched off.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.write().unwrap().rejecting = rejecting;
    }

    /// Makes every publish wait forever until switched off, like a broker
    /// that accepted the connection and never answers.
    pub fn set_hanging(&self, hanging: bool) {
        self.state.write().unwrap().hanging = hanging;
    }

    /// Returns all commands published so far, in order.
    pub fn published(&self) -> Vec<SagaCommand> {
        self.state.read().unwrap().published.clone()
    }

    /// Returns the message types published so far, in order.
    pub fn published_types(&self) -> Vec<&'static str> {
        self.state
            .read()
            .unwrap()
            .published
            .iter()
            .map(|c| c.message_type())
            .collect()
    }

    /// Returns the number of commands published so far.
    pub fn published_count(&self) -> usize {
        self.state.read().unwrap().published.len()
    }

    /// Forgets all published commands.
    pub fn clear(&self) {
        self.state.write().unwrap().published.clear();
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, command: &SagaCommand) -> Result<(), BusError> {
        let hanging = self.state.read().unwrap().hanging;
        if hanging {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.write().unwrap();

        if state.rejecting {
            return Err(BusError::Rejected(format!(
                "{} rejected",
                command.message_type()
            )));
        }
        if state.unavailable {
            return Err(BusError::Unavailable("bus offline".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BusError::Unavailable("transient failure".to_string()));
        }

        state.published.push(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use common::{BookingId, CorrelationId};
    use contracts::CancelBookingCommand;

    fn cancel_command() -> SagaCommand {
        SagaCommand::CancelBooking(CancelBookingCommand {
            correlation_id: CorrelationId::new(),
            booking_id: BookingId::new(),
            reason: "payment failed".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_records_commands() {
        let bus = InMemoryMessageBus::new();
        bus.publish(&cancel_command()).await.unwrap();

        assert_eq!(bus.published_count(), 1);
        assert_eq!(bus.published_types(), vec!["CancelBookingCommand"]);

        bus.clear();
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let bus = InMemoryMessageBus::new();
        bus.set_fail_next(2);

        let command = cancel_command();
        assert!(matches!(
            bus.publish(&command).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(bus.publish(&command).await.is_err());
        assert!(bus.publish(&command).await.is_ok());
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_hanging_publish_never_completes() {
        let bus = InMemoryMessageBus::new();
        bus.set_hanging(true);

        let command = cancel_command();
        let result =
            tokio::time::timeout(Duration::from_millis(20), bus.publish(&command)).await;
        assert!(result.is_err());
        assert_eq!(bus.published_count(), 0);

        bus.set_hanging(false);
        bus.publish(&command).await.unwrap();
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_rejecting_is_not_retryable() {
        let bus = InMemoryMessageBus::new();
        bus.set_rejecting(true);

        let err = bus.publish(&cancel_command()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(bus.published_count(), 0);
    }
}
