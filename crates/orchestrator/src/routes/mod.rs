pub mod dead_letters;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod sagas;

use std::sync::Arc;

use saga::SagaDispatcher;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub dispatcher: Arc<SagaDispatcher>,
}
