use anyhow::{Context, Result};
use discovery_reindexer::{
    api, config, logging,
    metrics::PipelineMetrics,
    pipeline::{
        ReindexService, RunRegistry, StuckJobWatchdog, WatchdogSettings, connect_queue_store,
    },
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    config::init_config();
    logging::init_tracing();
    let config = config::get_config();

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(PipelineMetrics::new());
    let store = connect_queue_store(config)
        .await
        .context("failed to open queue store")?;

    let runs = Arc::new(RunRegistry::new());
    let watchdog = Arc::new(
        StuckJobWatchdog::new(
            store.clone(),
            metrics.clone(),
            WatchdogSettings::from_config(config),
        )
        .with_runs(runs.clone()),
    )
    .spawn(shutdown.clone());

    let service = ReindexService::from_config(config, store, metrics, shutdown.clone())
        .context("failed to initialise re-index service")?
        .with_run_registry(runs);
    let app = api::create_router(Arc::new(service));

    let (listener, port) = bind_listener().await.context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await
        .context("HTTP server terminated unexpectedly")?;

    shutdown.cancel();
    watchdog.await.context("watchdog task panicked")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C (or when something else cancels `shutdown`), cancelling the root token so
/// drain workers and the watchdog wind down.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
