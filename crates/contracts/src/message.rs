use common::CorrelationId;
use serde::{Serialize, de::DeserializeOwned};

/// Trait for messages travelling on the bus.
///
/// Messages are routed to saga instances by their correlation id and
/// deduplicated by `(correlation_id, message_type)`.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the message type name.
    fn message_type(&self) -> &'static str;

    /// Returns the correlation id of the owning saga instance.
    fn correlation_id(&self) -> CorrelationId;
}
