//! HTTP message bus.

use std::time::Duration;

use async_trait::async_trait;
use contracts::{Message, SagaCommand};
use reqwest::{Client, StatusCode};
use saga::{BusError, MessageBus};

/// Publishes commands as JSON `POST`s to a single endpoint.
///
/// Connection failures, timeouts, 429 and 5xx responses are reported as
/// [`BusError::Unavailable`] and retried by the saga; other non-success
/// responses are [`BusError::Rejected`].
pub struct HttpMessageBus {
    client: Client,
    endpoint: String,
}

impl HttpMessageBus {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

#[async_trait]
impl MessageBus for HttpMessageBus {
    #[tracing::instrument(skip(self, command), fields(message_type = command.message_type(), correlation_id = %command.correlation_id()))]
    async fn publish(&self, command: &SagaCommand) -> Result<(), BusError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Message-Type", command.message_type())
            .json(command)
            .send()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(status = status.as_u16(), "command published");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{} returned {}: {}", self.endpoint, status, body);
        if Self::is_retryable_status(status) {
            Err(BusError::Unavailable(message))
        } else {
            Err(BusError::Rejected(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status() {
        assert!(HttpMessageBus::is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(HttpMessageBus::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!HttpMessageBus::is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!HttpMessageBus::is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let bus = HttpMessageBus::new("http://127.0.0.1:9/commands", Duration::from_millis(200))
            .unwrap();
        let command = SagaCommand::CancelBooking(contracts::CancelBookingCommand {
            correlation_id: common::CorrelationId::new(),
            booking_id: common::BookingId::new(),
            reason: "test".to_string(),
        });

        let err = bus.publish(&command).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
