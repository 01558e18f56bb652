//! Operator CLI for the re-indexer.
//!
//! Shares configuration with the server binary. `run` drives a complete re-index in the
//! foreground (watchdog included) and exits once the run settles; the remaining commands are
//! single operations against the discovery backend or the queue store.
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use discovery_reindexer::{
    config::Config,
    logging,
    metrics::PipelineMetrics,
    pipeline::{
        ReindexApi, ReindexService, RunRegistry, RunStatus, StuckJobWatchdog, WatchdogSettings,
        connect_queue_store,
    },
    queue::{JobId, QueueStore},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "reindexctl", about = "Operate the discovery re-indexer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-index a collection and wait for its queues to drain.
    Run {
        collection: String,
        /// Give up waiting after this many seconds; queued jobs stay in the store.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Delete one document from the discovery backend.
    Delete { document_id: String },
    /// Run one stuck-job sweep and print its report.
    Sweep,
    /// Move a failed job back to its queue.
    Requeue { job_id: JobId },
    /// Print per-state job totals.
    Counts,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    logging::init_cli_tracing();
    let config = Config::from_env().context("failed to load configuration")?;

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(PipelineMetrics::new());
    let store = connect_queue_store(&config)
        .await
        .context("failed to open queue store")?;

    match cli.command {
        Command::Run {
            collection,
            timeout_secs,
        } => {
            run_collection(
                &config,
                store,
                metrics,
                shutdown,
                &collection,
                timeout_secs.map(Duration::from_secs),
            )
            .await
        }
        Command::Delete { document_id } => {
            let service = ReindexService::from_config(&config, store, metrics, shutdown)
                .context("failed to initialise re-index service")?;
            let result = service
                .delete_document(&document_id)
                .await
                .with_context(|| format!("failed to delete document {document_id}"))?;
            print_json(&result)
        }
        Command::Sweep => {
            let watchdog =
                StuckJobWatchdog::new(store, metrics, WatchdogSettings::from_config(&config));
            let report = watchdog.sweep().await.context("watchdog sweep failed")?;
            print_json(&report)
        }
        Command::Requeue { job_id } => {
            store
                .requeue(job_id)
                .await
                .with_context(|| format!("failed to requeue job {job_id}"))?;
            println!("requeued {job_id}");
            Ok(())
        }
        Command::Counts => print_json(&store.counts().await.context("failed to read counts")?),
    }
}

async fn run_collection(
    config: &Config,
    store: Arc<dyn QueueStore>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
    collection: &str,
    timeout: Option<Duration>,
) -> Result<()> {
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
    let service = ReindexService::from_config(config, store, metrics.clone(), shutdown.clone())
        .context("failed to initialise re-index service")?
        .with_run_registry(runs);

    let (outcome, controller) = service
        .launch(collection)
        .await
        .with_context(|| format!("failed to start run for {collection}"))?;
    eprintln!(
        "run {} started: {} records in {} queue(s)",
        outcome.run_id,
        outcome.jobs_enqueued,
        outcome.queues.len()
    );

    let status = match timeout {
        Some(limit) => tokio::time::timeout(limit, controller.wait())
            .await
            .map_err(|_| anyhow!("run {} did not settle within {limit:?}", outcome.run_id)),
        None => Ok(controller.wait().await),
    };
    controller.shutdown().await;
    shutdown.cancel();
    watchdog.await.context("watchdog task panicked")?;

    let status = status?;
    print_json(&RunSummary {
        run_id: outcome.run_id.to_string(),
        total_found: outcome.total_found,
        status,
        metrics: metrics.snapshot(),
    })?;
    if !matches!(status, RunStatus::Completed { .. }) {
        bail!("run {} settled with unfinished jobs", outcome.run_id);
    }
    Ok(())
}

#[derive(Serialize)]
struct RunSummary {
    run_id: String,
    total_found: usize,
    status: RunStatus,
    metrics: discovery_reindexer::metrics::MetricsSnapshot,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
