use crate::config::Config;
use crate::discovery::{DeletionResult, DiscoveryService};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::drain::{DrainContext, DrainController, DrainSettings};
use crate::pipeline::formatter::{FormatterSettings, format_records};
use crate::pipeline::handler::{DiscoveryIngestHandler, JobHandler};
use crate::pipeline::router::QueueRouter;
use crate::pipeline::supervisor::{RunRegistry, RunStatus, ShutdownSupervisor};
use crate::pipeline::types::{PipelineError, RunOutcome, RunTarget};
use crate::queue::{
    JobCounts, JobId, MemoryQueueStore, QueueError, QueueStore, RedisQueueStore,
};
use crate::solr::{SolrService, fetch_all_records};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tunables for a re-index run.
#[derive(Debug, Clone)]
pub struct ReindexSettings {
    /// Response writer requested from the search index.
    pub format: String,
    /// Rows per page; zero fetches everything in one page.
    pub page_size: usize,
    /// Record attributes interpreted by the formatter.
    pub formatter: FormatterSettings,
    /// Worker tuning.
    pub drain: DrainSettings,
}

impl ReindexSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            format: config.solr_format.clone(),
            page_size: config.page_size,
            formatter: FormatterSettings::from_config(config),
            drain: DrainSettings::from_config(config),
        }
    }
}

/// Operations exposed to the HTTP surface and the operator CLI.
#[async_trait]
pub trait ReindexApi: Send + Sync {
    /// Fetch, format, and enqueue every record of `collection`, then start draining.
    ///
    /// Returns once the jobs are enqueued; draining continues in the background.
    async fn start_run(&self, collection: &str) -> Result<RunOutcome, PipelineError>;

    /// Delete one document from the discovery backend. Never touches the queue store.
    async fn delete_document(&self, document_id: &str) -> Result<DeletionResult, PipelineError>;

    /// Move a failed job back to its queue.
    async fn requeue_job(&self, id: JobId) -> Result<(), PipelineError>;

    /// Pipeline counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;

    /// Per-state job totals of the queue store.
    async fn queue_counts(&self) -> Result<JobCounts, PipelineError>;
}

/// Per-collection run state.
enum RunSlot {
    /// Records are being fetched and enqueued.
    Starting,
    /// Workers are attached.
    Draining(Arc<DrainController>),
}

impl RunSlot {
    fn is_busy(&self) -> bool {
        match self {
            Self::Starting => true,
            Self::Draining(controller) => controller.is_running(),
        }
    }
}

/// Runs in flight, keyed by collection.
type ActiveRuns = Arc<Mutex<HashMap<String, RunSlot>>>;

/// Claim on a collection held from the trigger until workers are attached. Dropping it
/// without [`RunReservation::commit`] frees the collection again.
struct RunReservation {
    runs: ActiveRuns,
    collection: String,
    committed: bool,
}

impl RunReservation {
    fn acquire(runs: &ActiveRuns, collection: &str) -> Result<Self, PipelineError> {
        let mut slots = lock(runs);
        if slots.get(collection).is_some_and(RunSlot::is_busy) {
            return Err(PipelineError::RunInProgress(collection.to_string()));
        }
        slots.insert(collection.to_string(), RunSlot::Starting);
        Ok(Self {
            runs: runs.clone(),
            collection: collection.to_string(),
            committed: false,
        })
    }

    fn commit(mut self, controller: Arc<DrainController>) {
        lock(&self.runs).insert(self.collection.clone(), RunSlot::Draining(controller));
        self.committed = true;
    }
}

impl Drop for RunReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = lock(&self.runs);
        if matches!(slots.get(&self.collection), Some(RunSlot::Starting)) {
            slots.remove(&self.collection);
        }
    }
}

/// Orchestrates the Page Fetcher, Record Formatter, Queue Router, drain controllers, and
/// their supervisors.
pub struct ReindexService {
    solr: SolrService,
    discovery: Arc<DiscoveryService>,
    store: Arc<dyn QueueStore>,
    router: Arc<QueueRouter>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<PipelineMetrics>,
    settings: ReindexSettings,
    shutdown: CancellationToken,
    runs: ActiveRuns,
    registry: Arc<RunRegistry>,
}

impl ReindexService {
    /// Wire the service from explicit collaborators.
    pub fn new(
        solr: SolrService,
        discovery: Arc<DiscoveryService>,
        store: Arc<dyn QueueStore>,
        metrics: Arc<PipelineMetrics>,
        settings: ReindexSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let handler: Arc<dyn JobHandler> = Arc::new(DiscoveryIngestHandler::new(discovery.clone()));
        Self::with_handler(solr, discovery, store, handler, metrics, settings, shutdown)
    }

    /// Wire the service with a custom job handler.
    pub fn with_handler(
        solr: SolrService,
        discovery: Arc<DiscoveryService>,
        store: Arc<dyn QueueStore>,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<PipelineMetrics>,
        settings: ReindexSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let router = Arc::new(QueueRouter::new(store.clone(), metrics.clone()));
        Self {
            solr,
            discovery,
            store,
            router,
            handler,
            metrics,
            settings,
            shutdown,
            runs: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(RunRegistry::new()),
        }
    }

    /// Register run supervisors in `registry`, typically one shared with the watchdog.
    pub fn with_run_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Wire the service from the loaded configuration.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn QueueStore>,
        metrics: Arc<PipelineMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let solr = SolrService::with_timeout(&config.solr_url, config.http_timeout())?;
        let discovery = Arc::new(DiscoveryService::with_settings(
            crate::discovery::client::DiscoverySettings::from_config(config),
        )?);
        Ok(Self::new(
            solr,
            discovery,
            store,
            metrics,
            ReindexSettings::from_config(config),
            shutdown,
        ))
    }

    /// Shared queue store.
    pub fn store(&self) -> Arc<dyn QueueStore> {
        self.store.clone()
    }

    /// Start a run and return its drain controller so callers can wait on it.
    ///
    /// The collection is reserved before anything is fetched, so a concurrent trigger for it
    /// fails with `RunInProgress` without enqueueing.
    pub async fn launch(
        &self,
        collection: &str,
    ) -> Result<(RunOutcome, Arc<DrainController>), PipelineError> {
        let reservation = RunReservation::acquire(&self.runs, collection)?;

        let fetched = fetch_all_records(
            &self.solr,
            collection,
            &self.settings.format,
            self.settings.page_size,
        )
        .await?;
        let batches = format_records(&fetched.records, &self.settings.formatter);

        let run_id = Uuid::new_v4();
        let handles = self
            .router
            .route_batches(run_id, collection, &batches)
            .await?;
        let jobs_enqueued: usize = batches.iter().map(|batch| batch.records.len()).sum();
        if jobs_enqueued != fetched.total_found {
            tracing::warn!(
                collection,
                total_found = fetched.total_found,
                jobs_enqueued,
                "Run target follows the enqueued job count"
            );
        }

        let supervisor = Arc::new(ShutdownSupervisor::new(RunTarget {
            run_id,
            expected_total: jobs_enqueued,
        }));
        let controller = DrainController::new(
            collection,
            DrainContext {
                store: self.store.clone(),
                router: self.router.clone(),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
            },
            supervisor.clone(),
            self.settings.drain,
            &self.shutdown,
        );
        self.registry.register(&supervisor);
        reservation.commit(controller.clone());
        self.metrics.record_run_started();

        controller.process_all_queues(&handles);
        if let Err(error) = controller.process_all_child_queues().await {
            tracing::warn!(collection, error = %error, "Failed to scan for child queues");
        }
        self.watch_completion(collection, controller.clone());

        let outcome = RunOutcome {
            run_id,
            total_found: fetched.total_found,
            queues: handles.into_iter().map(|handle| handle.name).collect(),
            jobs_enqueued,
        };
        tracing::info!(
            collection,
            run_id = %outcome.run_id,
            total_found = outcome.total_found,
            queues = outcome.queues.len(),
            "Queues are processing"
        );
        Ok((outcome, controller))
    }

    /// Stop consumers once the run settles and forget it.
    fn watch_completion(&self, collection: &str, controller: Arc<DrainController>) {
        let runs = self.runs.clone();
        let metrics = self.metrics.clone();
        let collection = collection.to_string();
        tokio::spawn(async move {
            let status = controller.wait().await;
            controller.shutdown().await;
            if let RunStatus::Completed { expected } = status {
                metrics.record_run_completed();
                tracing::info!(collection = %collection, expected, "Run completed");
            }
            let mut runs = lock(&runs);
            if let Some(RunSlot::Draining(current)) = runs.get(&collection)
                && Arc::ptr_eq(current, &controller)
            {
                runs.remove(&collection);
            }
        });
    }
}

#[async_trait]
impl ReindexApi for ReindexService {
    async fn start_run(&self, collection: &str) -> Result<RunOutcome, PipelineError> {
        self.launch(collection).await.map(|(outcome, _)| outcome)
    }

    async fn delete_document(&self, document_id: &str) -> Result<DeletionResult, PipelineError> {
        Ok(self.discovery.delete_document(document_id).await?)
    }

    async fn requeue_job(&self, id: JobId) -> Result<(), PipelineError> {
        self.store.requeue(id).await?;
        tracing::info!(job_id = %id, "Failed job requeued");
        Ok(())
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn queue_counts(&self) -> Result<JobCounts, PipelineError> {
        Ok(self.store.counts().await?)
    }
}

/// Open the queue store selected by configuration: Redis when `REDIS_URL` is set, memory
/// otherwise.
pub async fn connect_queue_store(config: &Config) -> Result<Arc<dyn QueueStore>, QueueError> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisQueueStore::connect(url, &config.queue_prefix).await?;
            tracing::info!(prefix = %config.queue_prefix, "Using Redis queue store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("REDIS_URL not set; queued jobs will not survive a restart");
            Ok(Arc::new(MemoryQueueStore::new()))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::discovery::client::DiscoverySettings;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn service(solr: &MockServer, discovery: &MockServer) -> ReindexService {
        let discovery = DiscoveryService::with_settings(DiscoverySettings {
            base_url: discovery.base_url(),
            environment_id: "env".into(),
            collection_id: "col".into(),
            api_version: "2017-11-07".into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(5),
        })
        .expect("discovery");
        let mut settings = ReindexSettings::from_config(&sample_config());
        settings.page_size = 2;
        settings.drain = DrainSettings {
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(50),
            max_job_duration: Duration::from_secs(5),
        };
        ReindexService::new(
            SolrService::with_base_url(&solr.base_url()).expect("solr"),
            Arc::new(discovery),
            Arc::new(MemoryQueueStore::new()),
            Arc::new(PipelineMetrics::new()),
            settings,
            CancellationToken::new(),
        )
    }

    async fn mock_collection(server: &MockServer, docs: serde_json::Value, total: usize) {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/obra/select")
                    .query_param("rows", "0");
                then.status(200)
                    .json_body(json!({ "response": { "numFound": total, "start": 0, "docs": [] } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/obra/select")
                    .query_param("start", "0")
                    .query_param("rows", "2");
                then.status(200)
                    .json_body(json!({ "response": { "numFound": total, "start": 0, "docs": docs } }));
            })
            .await;
    }

    #[tokio::test]
    async fn run_enqueues_drains_and_completes() {
        let solr = MockServer::start_async().await;
        let discovery = MockServer::start_async().await;
        mock_collection(
            &solr,
            json!([
                { "id": "1", "categoria": "poesia" },
                { "id": "2", "categoria": "teatro" }
            ]),
            2,
        )
        .await;
        let ingest = discovery
            .mock_async(|when, then| {
                when.method(POST);
                then.status(202).json_body(json!({ "status": "processing" }));
            })
            .await;

        let service = service(&solr, &discovery);
        let (outcome, controller) = service.launch("obra").await.expect("run");
        assert_eq!(outcome.total_found, 2);
        assert_eq!(outcome.jobs_enqueued, 2);
        assert_eq!(outcome.queues, vec!["obra-poesia", "obra-teatro"]);

        let status = tokio::time::timeout(Duration::from_secs(5), controller.wait())
            .await
            .expect("run settled");
        assert_eq!(status, RunStatus::Completed { expected: 2 });
        ingest.assert_hits_async(2).await;
        assert_eq!(service.metrics_snapshot().jobs_completed, 2);
    }

    #[tokio::test]
    async fn second_trigger_while_draining_is_rejected() {
        let solr = MockServer::start_async().await;
        let discovery = MockServer::start_async().await;
        mock_collection(&solr, json!([{ "id": "1", "categoria": "poesia" }]), 1).await;
        discovery
            .mock_async(|when, then| {
                when.method(POST);
                then.status(202).delay(Duration::from_millis(300));
            })
            .await;

        let service = service(&solr, &discovery);
        service.start_run("obra").await.expect("first run");
        let error = service.start_run("obra").await.expect_err("second run");
        assert!(matches!(error, PipelineError::RunInProgress(_)));
    }

    #[tokio::test]
    async fn concurrent_triggers_enqueue_only_once() {
        let solr = MockServer::start_async().await;
        let discovery = MockServer::start_async().await;
        mock_collection(&solr, json!([{ "id": "1", "categoria": "poesia" }]), 1).await;
        discovery
            .mock_async(|when, then| {
                when.method(POST);
                then.status(202).delay(Duration::from_millis(300));
            })
            .await;

        let service = service(&solr, &discovery);
        let (first, second) = tokio::join!(service.start_run("obra"), service.start_run("obra"));

        let rejected = [&first, &second]
            .iter()
            .filter(|result| matches!(result, Err(PipelineError::RunInProgress(_))))
            .count();
        assert_eq!(rejected, 1);
        assert!(first.is_ok() || second.is_ok());
        let snapshot = service.metrics_snapshot();
        assert_eq!(snapshot.runs_started, 1);
        assert_eq!(snapshot.jobs_enqueued, 1);
    }

    #[tokio::test]
    async fn failed_start_releases_the_collection() {
        let discovery = MockServer::start_async().await;
        let solr = MockServer::start_async().await;
        solr.mock_async(|when, then| {
            when.method(GET);
            then.status(503).body("down");
        })
        .await;

        let service = service(&solr, &discovery);
        for _ in 0..2 {
            let error = service.start_run("obra").await.expect_err("unavailable");
            assert_eq!(error.status_code(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[tokio::test]
    async fn registered_run_settles_when_watchdog_reaps_its_job() {
        use crate::pipeline::watchdog::{StuckJobWatchdog, WatchdogSettings};

        let solr = MockServer::start_async().await;
        let discovery = MockServer::start_async().await;
        mock_collection(&solr, json!([{ "id": "1", "categoria": "poesia" }]), 1).await;

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(RunRegistry::new());
        let mut settings = ReindexSettings::from_config(&sample_config());
        settings.page_size = 2;
        let service = ReindexService::new(
            SolrService::with_base_url(&solr.base_url()).expect("solr"),
            Arc::new(
                DiscoveryService::with_settings(DiscoverySettings {
                    base_url: discovery.base_url(),
                    environment_id: "env".into(),
                    collection_id: "col".into(),
                    api_version: "2017-11-07".into(),
                    username: None,
                    password: None,
                    timeout: Duration::from_secs(5),
                })
                .expect("discovery"),
            ),
            store.clone(),
            metrics.clone(),
            settings,
            shutdown,
        )
        .with_run_registry(registry.clone());

        let (_, controller) = service.launch("obra").await.expect("run");
        let orphan = store
            .claim_next("obra-poesia")
            .await
            .expect("claim")
            .expect("job");
        let watchdog = StuckJobWatchdog::new(store, metrics, WatchdogSettings::default())
            .with_runs(registry);
        let report = watchdog
            .sweep_at(orphan.updated_at + 10_000)
            .await
            .expect("sweep");

        assert_eq!(report.reaped, 1);
        let status = tokio::time::timeout(Duration::from_secs(1), controller.wait())
            .await
            .expect("run settled");
        assert_eq!(
            status,
            RunStatus::Settled {
                completed: 0,
                unfinished: 1,
                expected: 1
            }
        );
    }

    #[tokio::test]
    async fn unreachable_index_fails_before_enqueueing() {
        let discovery = MockServer::start_async().await;
        let solr = MockServer::start_async().await;
        solr.mock_async(|when, then| {
            when.method(GET);
            then.status(503).body("down");
        })
        .await;

        let service = service(&solr, &discovery);
        let error = service.start_run("obra").await.expect_err("unavailable");
        assert_eq!(error.status_code(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(service.queue_counts().await.expect("counts"), JobCounts::default());
    }

    #[tokio::test]
    async fn deleting_unknown_document_leaves_queues_untouched() {
        let solr = MockServer::start_async().await;
        let discovery = MockServer::start_async().await;
        discovery
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/v1/environments/env/collections/col/documents/missing");
                then.status(404);
            })
            .await;

        let service = service(&solr, &discovery);
        let error = service
            .delete_document("missing")
            .await
            .expect_err("not found");
        assert!(matches!(error, PipelineError::NotFound(_)));
        assert_eq!(service.queue_counts().await.expect("counts"), JobCounts::default());
    }

    #[tokio::test]
    async fn requeue_of_unknown_job_is_not_found() {
        let solr = MockServer::start_async().await;
        let discovery = MockServer::start_async().await;
        let service = service(&solr, &discovery);
        let error = service
            .requeue_job(Uuid::new_v4())
            .await
            .expect_err("missing");
        assert_eq!(error.status_code(), reqwest::StatusCode::NOT_FOUND);
    }
}
