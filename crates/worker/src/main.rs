//! Worker entry point.

use std::time::Duration;

use event_bus::run_consumer;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::config::{LogFormat, WorkerConfig};
use worker::error::WorkerError;

/// Base delay between redeliveries of a failed event; grows per attempt.
const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

fn init_tracing(config: &WorkerConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // 1. Load configuration and initialize tracing
    let config = WorkerConfig::from_env()?;
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| WorkerError::Metrics(e.to_string()))?;

    // 3. Wire collaborators, catalog and dispatch table
    let worker::Worker {
        state,
        dispatcher,
        receiver,
    } = worker::bootstrap(&config).await?;

    // 4. Start consuming the transport
    let consumer = tokio::spawn(run_consumer(
        receiver,
        dispatcher,
        config.redelivery_limit,
        REDELIVERY_DELAY,
    ));

    // 5. Serve HTTP until shutdown
    let app = worker::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting worker");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // sagas hold transport handles, so the consumer loop never drains on its own
    consumer.abort();
    tracing::info!("worker shut down gracefully");
    Ok(())
}
