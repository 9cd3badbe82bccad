//! Orchestrator entry point.

use std::sync::Arc;

use orchestrator::config::{Config, LogFormat};
use orchestrator::error::StartupError;
use orchestrator::AppState;
use saga::TimeoutPoller;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    orchestrator::describe_metrics();

    // 3. Wire store, bus and dispatcher
    let dispatcher = orchestrator::build_dispatcher(&config).await?;

    // 4. Start the timeout poller
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = TimeoutPoller::new(
        dispatcher.clone(),
        config.timeout_poll_interval,
        config.timeout_batch_size,
    )
    .with_lease(config.timeout_lease)
    .with_outbox_grace(config.outbox_grace);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    // 5. Build the application
    let state = Arc::new(AppState { dispatcher });
    let app = orchestrator::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting orchestrator");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 7. Stop the poller after in-flight requests drained
    let _ = shutdown_tx.send(true);
    if let Err(e) = poller_task.await {
        tracing::error!(error = %e, "timeout poller task failed");
    }

    served.map_err(StartupError::Serve)?;
    tracing::info!("server shut down gracefully");
    Ok(())
}
