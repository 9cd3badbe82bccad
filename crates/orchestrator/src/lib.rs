//! HTTP service running the booking saga orchestrator.
//!
//! Receives saga events on `POST /messages`, exposes saga and dead letter
//! inspection endpoints, and publishes commands through the configured
//! message bus. Structured logging (tracing) and Prometheus metrics are
//! wired in the binary.

pub mod bus;
pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryMessageBus, MessageBus, SagaDispatcher, SagaSettings};
use saga_store::{InMemorySagaStore, PostgresSagaStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bus::HttpMessageBus;
use config::Config;
use error::StartupError;
pub use routes::AppState;

const OUTBOUND_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Registers help text for the saga metrics with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!("saga_messages_received_total", "Inbound saga events by type");
    metrics::describe_histogram!(
        "saga_dispatch_duration_seconds",
        metrics::Unit::Seconds,
        "Time to dispatch one inbound event"
    );
    metrics::describe_counter!("saga_transitions_total", "Applied state transitions");
    metrics::describe_counter!("saga_messages_ignored_total", "Discarded events by reason");
    metrics::describe_counter!(
        "saga_concurrency_conflicts_total",
        "Saves that lost an optimistic concurrency race"
    );
    metrics::describe_counter!(
        "saga_conflict_retries_exhausted_total",
        "Dispatches that gave up after repeated conflicts"
    );
    metrics::describe_counter!("saga_commands_published_total", "Commands published by type");
    metrics::describe_counter!("saga_publish_retries_total", "Effect retries by effect kind");
    metrics::describe_counter!("saga_dead_letters_total", "Dead-lettered effects by kind");
    metrics::describe_counter!("saga_timeouts_fired_total", "Due timeouts delivered by kind");
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/messages", post(routes::messages::receive))
        .route("/sagas", get(routes::sagas::list))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/dead-letters", get(routes::dead_letters::list))
        .route("/dead-letters/{id}/redrive", post(routes::dead_letters::redrive))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state backed by the in-memory store and bus.
pub fn create_default_state(
    settings: &SagaSettings,
) -> (Arc<AppState>, InMemorySagaStore, InMemoryMessageBus) {
    let store = InMemorySagaStore::new();
    let bus = InMemoryMessageBus::new();
    let dispatcher = SagaDispatcher::with_store(store.clone(), Arc::new(bus.clone()), settings);

    let state = Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
    });
    (state, store, bus)
}

/// Builds the dispatcher for a configuration.
///
/// Uses PostgreSQL when `database_url` is set (running migrations first) and
/// the HTTP bus when `outbound_url` is set; otherwise the in-memory backends.
pub async fn build_dispatcher(config: &Config) -> Result<Arc<SagaDispatcher>, StartupError> {
    let bus: Arc<dyn MessageBus> = match &config.outbound_url {
        Some(url) => {
            tracing::info!(%url, "publishing commands over HTTP");
            Arc::new(HttpMessageBus::new(url.clone(), OUTBOUND_REQUEST_TIMEOUT)?)
        }
        None => {
            tracing::warn!("SAGA_OUTBOUND_URL unset, commands are kept in memory");
            Arc::new(InMemoryMessageBus::new())
        }
    };

    let dispatcher = match &config.database_url {
        Some(url) => {
            let store = PostgresSagaStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL saga store");
            SagaDispatcher::with_store(store, bus, &config.saga)
        }
        None => {
            tracing::warn!("DATABASE_URL unset, saga state is kept in memory");
            SagaDispatcher::with_store(InMemorySagaStore::new(), bus, &config.saga)
        }
    };

    Ok(Arc::new(dispatcher))
}
