//! Queue Drain Controller: attaches workers to parent and child queues until the run settles.

use crate::config::Config;
use crate::metrics::PipelineMetrics;
use crate::pipeline::handler::JobHandler;
use crate::pipeline::router::QueueRouter;
use crate::pipeline::supervisor::{RunStatus, ShutdownSupervisor};
use crate::pipeline::types::ChildConversionJob;
use crate::queue::{ConversionJob, QueueError, QueueHandle, QueueStore, child_queue_name};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;

/// Worker tuning for a drain controller.
#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    /// Workers attached to each queue.
    pub concurrency: usize,
    /// Pause between claim attempts on an empty queue.
    pub poll_interval: Duration,
    /// Interval at which a worker refreshes the `updated_at` of its active job.
    pub heartbeat_interval: Duration,
    /// Longest a handler may run. Past it the handler is dropped, heartbeats stop, and the
    /// job fails.
    pub max_job_duration: Duration,
}

impl DrainSettings {
    /// Derive settings from the loaded configuration. Heartbeats run at half the watchdog
    /// threshold.
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            poll_interval: config.queue_poll_interval(),
            heartbeat_interval: (config.watchdog_stale_threshold() / 2)
                .max(Duration::from_millis(10)),
            max_job_duration: config.job_timeout().max(Duration::from_millis(1)),
        }
    }
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(1),
            max_job_duration: Duration::from_secs(60),
        }
    }
}

/// Collaborators shared by every worker of one run.
pub struct DrainContext {
    /// Queue store holding the run's jobs.
    pub store: Arc<dyn QueueStore>,
    /// Router used to enqueue child jobs.
    pub router: Arc<QueueRouter>,
    /// Per-job processing logic.
    pub handler: Arc<dyn JobHandler>,
    /// Pipeline counters.
    pub metrics: Arc<PipelineMetrics>,
}

/// Drains the queues of one run.
///
/// Workers claim jobs, run the handler, and report completions to the run's supervisor. They
/// stop once the supervisor settles or the controller is stopped; a job in flight at that
/// moment finishes first.
pub struct DrainController {
    collection: String,
    context: DrainContext,
    supervisor: Arc<ShutdownSupervisor>,
    settings: DrainSettings,
    stop: CancellationToken,
    attached: Mutex<HashSet<String>>,
    parents: Mutex<HashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DrainController {
    /// Create a controller for `collection`. `shutdown` stops the workers early when cancelled.
    pub fn new(
        collection: impl Into<String>,
        context: DrainContext,
        supervisor: Arc<ShutdownSupervisor>,
        settings: DrainSettings,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            collection: collection.into(),
            context,
            supervisor,
            settings,
            stop: shutdown.child_token(),
            attached: Mutex::new(HashSet::new()),
            parents: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Supervisor of the drained run.
    pub fn supervisor(&self) -> &Arc<ShutdownSupervisor> {
        &self.supervisor
    }

    /// Attach workers to every handle. Queues that already have workers are skipped.
    ///
    /// Parent handles passed here define which child queues belong to the run.
    pub fn process_all_queues(self: &Arc<Self>, handles: &[QueueHandle]) -> usize {
        {
            let mut parents = lock(&self.parents);
            for handle in handles.iter().filter(|handle| !handle.is_child_queue()) {
                parents.insert(handle.name.clone());
            }
        }
        handles
            .iter()
            .filter(|handle| self.attach(&handle.name))
            .count()
    }

    /// Attach workers to every existing child queue of this run's parent queues that has
    /// none yet.
    ///
    /// Child queues appear while parents are processed, so this is called again each time a
    /// parent job spawns children.
    pub async fn process_all_child_queues(self: &Arc<Self>) -> Result<usize, QueueError> {
        let children: HashSet<String> = lock(&self.parents)
            .iter()
            .map(|parent| child_queue_name(parent))
            .collect();
        if children.is_empty() {
            return Ok(0);
        }
        let names = self.context.store.list_queues().await?;
        Ok(names
            .iter()
            .filter(|name| children.contains(name.as_str()))
            .filter(|name| self.attach(name))
            .count())
    }

    /// Wait until the run settles.
    pub async fn wait(&self) -> RunStatus {
        self.supervisor.wait().await
    }

    /// Stop claiming new jobs.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether workers are still claiming jobs.
    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled() && !self.supervisor.is_settled()
    }

    /// Stop the workers and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.await {
                tracing::error!(error = %error, "Drain worker terminated abnormally");
            }
        }
    }

    fn attach(self: &Arc<Self>, queue: &str) -> bool {
        if !self.is_running() || !lock(&self.attached).insert(queue.to_string()) {
            return false;
        }
        tracing::info!(
            queue,
            collection = %self.collection,
            run_id = %self.supervisor.run_id(),
            workers = self.settings.concurrency,
            "Attaching workers to queue"
        );
        let mut workers = lock(&self.workers);
        for worker in 0..self.settings.concurrency {
            let controller = Arc::clone(self);
            let queue = queue.to_string();
            workers.push(tokio::spawn(async move {
                controller.run_worker(queue, worker).await;
            }));
        }
        true
    }

    async fn run_worker(self: Arc<Self>, queue: String, worker: usize) {
        tracing::debug!(queue = %queue, worker, "Worker started");
        while self.is_running() {
            match self.context.store.claim_next(&queue).await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(queue = %queue, worker, error = %error, "Claim failed");
                }
            }
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.supervisor.settled() => break,
                _ = sleep(self.settings.poll_interval) => {}
            }
        }
        tracing::debug!(queue = %queue, worker, "Worker stopped");
    }

    async fn process_job(self: &Arc<Self>, job: ConversionJob) {
        let counted = self.supervisor.owns(job.run_id);
        let outcome = self.handle_with_heartbeat(&job).await;

        let children = match outcome {
            Ok(children) => children,
            Err(reason) => {
                self.fail_job(&job, counted, &reason).await;
                return;
            }
        };

        let spawned = children.len();
        if spawned > 0 {
            if let Err(error) = self.enqueue_children(&job, counted, children).await {
                let reason = format!("Failed to enqueue child jobs: {error}");
                self.fail_job(&job, counted, &reason).await;
                return;
            }
        }

        match self.context.store.complete(job.id).await {
            Ok(()) => {
                self.context.metrics.record_completed();
                if counted {
                    self.supervisor.record_completion(job.id);
                } else {
                    tracing::debug!(
                        job_id = %job.id,
                        job_run = %job.run_id,
                        "Completed job from another run; not counted"
                    );
                }
            }
            Err(QueueError::NotFound(_)) => {
                tracing::warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    "Job was reaped before it completed; not counted"
                );
                if counted {
                    self.supervisor.record_lost(job.id);
                }
            }
            Err(error) => {
                tracing::error!(
                    job_id = %job.id,
                    error = %error,
                    "Failed to mark job complete; counting it as lost"
                );
                if counted {
                    self.supervisor.record_lost(job.id);
                }
            }
        }

        if spawned > 0
            && let Err(error) = self.process_all_child_queues().await
        {
            tracing::warn!(error = %error, "Failed to scan for child queues");
        }
    }

    /// Run the handler while refreshing the job's liveness timestamp, for at most
    /// `max_job_duration`. A panicking handler fails the job instead of the worker.
    async fn handle_with_heartbeat(
        &self,
        job: &ConversionJob,
    ) -> Result<Vec<ChildConversionJob>, String> {
        let handling = AssertUnwindSafe(self.context.handler.handle(job)).catch_unwind();
        tokio::pin!(handling);
        let deadline = sleep(self.settings.max_job_duration);
        tokio::pin!(deadline);

        let mut heartbeat = interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut handling => {
                    return match result {
                        Ok(outcome) => outcome.map_err(|failure| failure.to_string()),
                        Err(panic) => Err(format!(
                            "Job handler panicked: {}",
                            panic_message(&*panic)
                        )),
                    };
                }
                _ = &mut deadline => {
                    return Err(format!(
                        "Job handler exceeded {} ms",
                        self.settings.max_job_duration.as_millis()
                    ));
                }
                _ = heartbeat.tick() => {
                    if let Err(error) = self.context.store.touch(job.id).await {
                        tracing::debug!(job_id = %job.id, error = %error, "Heartbeat not recorded");
                    }
                }
            }
        }
    }

    /// Enqueue children one by one, raising the run target ahead of each so the run cannot
    /// complete while any of them is pending.
    async fn enqueue_children(
        &self,
        parent: &ConversionJob,
        counted: bool,
        children: Vec<ChildConversionJob>,
    ) -> Result<(), QueueError> {
        for child in children {
            if counted {
                self.supervisor.extend(1);
            }
            if let Err(error) = self
                .context
                .router
                .enqueue_child(parent.run_id, &parent.queue, child)
                .await
            {
                if counted {
                    self.supervisor.retract(1);
                }
                return Err(error);
            }
        }
        tracing::debug!(job_id = %parent.id, "Child jobs enqueued");
        Ok(())
    }

    async fn fail_job(&self, job: &ConversionJob, counted: bool, reason: &str) {
        tracing::error!(
            job_id = %job.id,
            queue = %job.queue,
            document_id = %job.payload.document_id,
            attempts = job.attempts,
            reason,
            "Job failed"
        );
        match self.context.store.fail(job.id, reason).await {
            Ok(()) => {
                self.context.metrics.record_failed();
                if counted {
                    self.supervisor.record_failure(job.id);
                }
            }
            Err(error) => {
                if !matches!(error, QueueError::NotFound(_)) {
                    tracing::error!(
                        job_id = %job.id,
                        error = %error,
                        "Failed to record job failure; counting it as lost"
                    );
                }
                if counted {
                    self.supervisor.record_lost(job.id);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryError;
    use crate::pipeline::types::{FormattedBatch, FormattedRecord, JobHandlerFailure, RunTarget};
    use crate::queue::{JobState, MemoryQueueStore};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Succeeds for every record except ids listed in `failing`; spawns `children` per parent.
    /// Ids in `hanging` never resolve and ids in `panicking` panic.
    struct ScriptedHandler {
        failing: Vec<String>,
        hanging: Vec<String>,
        panicking: Vec<String>,
        children: usize,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new() -> Self {
            Self {
                failing: Vec::new(),
                hanging: Vec::new(),
                panicking: Vec::new(),
                children: 0,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(
            &self,
            job: &ConversionJob,
        ) -> Result<Vec<ChildConversionJob>, JobHandlerFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hanging.contains(&job.payload.document_id) {
                std::future::pending::<()>().await;
            }
            if self.panicking.contains(&job.payload.document_id) {
                panic!("handler crashed on {}", job.payload.document_id);
            }
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.failing.contains(&job.payload.document_id) {
                return Err(JobHandlerFailure::Discovery(
                    DiscoveryError::UnexpectedStatus {
                        status: StatusCode::BAD_REQUEST,
                        body: "rejected".into(),
                    },
                ));
            }
            if job.is_child() {
                return Ok(Vec::new());
            }
            Ok((0..self.children)
                .map(|index| ChildConversionJob {
                    parent: job.id,
                    index,
                    record: record(&format!("{}-child-{index}", job.payload.document_id)),
                })
                .collect())
        }
    }

    fn record(id: &str) -> FormattedRecord {
        FormattedRecord {
            document_id: id.into(),
            category: "poesia".into(),
            fields: Map::new(),
            children: Vec::new(),
        }
    }

    struct Harness {
        store: Arc<MemoryQueueStore>,
        metrics: Arc<PipelineMetrics>,
        router: Arc<QueueRouter>,
        run_id: Uuid,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryQueueStore::new());
            let metrics = Arc::new(PipelineMetrics::new());
            let router = Arc::new(QueueRouter::new(store.clone(), metrics.clone()));
            Self {
                store,
                metrics,
                router,
                run_id: Uuid::new_v4(),
            }
        }

        async fn enqueue(&self, ids: &[&str]) -> QueueHandle {
            let batch = FormattedBatch {
                category: "poesia".into(),
                records: ids.iter().map(|id| record(id)).collect(),
            };
            self.router
                .create_queue(self.run_id, &batch, "obra-poesia", 0)
                .await
                .expect("queue")
        }

        fn controller(
            &self,
            handler: Arc<dyn JobHandler>,
            expected_total: usize,
        ) -> Arc<DrainController> {
            self.controller_with(handler, expected_total, Duration::from_secs(5))
        }

        fn controller_with(
            &self,
            handler: Arc<dyn JobHandler>,
            expected_total: usize,
            max_job_duration: Duration,
        ) -> Arc<DrainController> {
            let supervisor = Arc::new(ShutdownSupervisor::new(RunTarget {
                run_id: self.run_id,
                expected_total,
            }));
            DrainController::new(
                "obra",
                DrainContext {
                    store: self.store.clone(),
                    router: self.router.clone(),
                    handler,
                    metrics: self.metrics.clone(),
                },
                supervisor,
                DrainSettings {
                    concurrency: 2,
                    poll_interval: Duration::from_millis(5),
                    heartbeat_interval: Duration::from_millis(10),
                    max_job_duration,
                },
                &CancellationToken::new(),
            )
        }
    }

    async fn settle(controller: &DrainController) -> RunStatus {
        let status = tokio::time::timeout(Duration::from_secs(5), controller.wait())
            .await
            .expect("run settled in time");
        controller.shutdown().await;
        status
    }

    #[tokio::test]
    async fn drains_queue_and_completes_run() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["a", "b", "c", "d"]).await;
        let handler = Arc::new(ScriptedHandler::new());
        let controller = harness.controller(handler.clone(), 4);

        assert_eq!(controller.process_all_queues(&[handle.clone(), handle]), 1);
        let status = settle(&controller).await;

        assert_eq!(status, RunStatus::Completed { expected: 4 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(harness.store.counts().await.expect("counts").inactive, 0);
        assert_eq!(harness.metrics.snapshot().jobs_completed, 4);
    }

    #[tokio::test]
    async fn failure_is_isolated_and_settles_run() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["a", "bad", "c"]).await;
        let mut handler = ScriptedHandler::new();
        handler.failing = vec!["bad".into()];
        let controller = harness.controller(Arc::new(handler), 3);

        controller.process_all_queues(&[handle]);
        let status = settle(&controller).await;

        assert_eq!(
            status,
            RunStatus::Settled {
                completed: 2,
                unfinished: 1,
                expected: 3
            }
        );
        let counts = harness.store.counts().await.expect("counts");
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(harness.metrics.snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn children_extend_target_and_are_drained() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["a", "b"]).await;
        let mut handler = ScriptedHandler::new();
        handler.children = 2;
        let handler = Arc::new(handler);
        let controller = harness.controller(handler.clone(), 2);

        controller.process_all_queues(&[handle]);
        let status = settle(&controller).await;

        assert_eq!(status, RunStatus::Completed { expected: 6 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
        assert!(
            harness
                .store
                .list_queues()
                .await
                .expect("queues")
                .contains(&"obra-poesia:children".to_string())
        );
        assert_eq!(harness.metrics.snapshot().jobs_enqueued, 6);
    }

    #[tokio::test]
    async fn jobs_from_other_runs_are_processed_but_not_counted() {
        let harness = Harness::new();
        let stale = FormattedBatch {
            category: "poesia".into(),
            records: vec![record("old")],
        };
        harness
            .router
            .create_queue(Uuid::new_v4(), &stale, "obra-poesia", 0)
            .await
            .expect("stale job");
        let handle = harness.enqueue(&["new"]).await;
        let handler = Arc::new(ScriptedHandler::new());
        let controller = harness.controller(handler.clone(), 1);

        controller.process_all_queues(&[handle]);
        let status = settle(&controller).await;

        assert_eq!(status, RunStatus::Completed { expected: 1 });
        assert_eq!(harness.metrics.snapshot().jobs_completed, 2);
    }

    #[tokio::test]
    async fn long_jobs_keep_their_heartbeat_fresh() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["slow"]).await;
        let mut handler = ScriptedHandler::new();
        handler.delay = Duration::from_millis(120);
        let controller = harness.controller(Arc::new(handler), 1);

        controller.process_all_queues(&[handle]);
        sleep(Duration::from_millis(60)).await;
        let active = harness.store.list_active().await.expect("active");
        assert_eq!(active.len(), 1);
        let job = harness.store.get(active[0]).await.expect("job");
        assert_eq!(job.state, JobState::Active);
        assert!(crate::queue::now_millis() - job.updated_at < 60);

        settle(&controller).await;
    }

    #[tokio::test]
    async fn reaped_job_is_not_counted_as_completed() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["slow"]).await;
        let mut handler = ScriptedHandler::new();
        handler.delay = Duration::from_millis(80);
        let controller = harness.controller(Arc::new(handler), 1);

        controller.process_all_queues(&[handle]);
        sleep(Duration::from_millis(20)).await;
        let active = harness.store.list_active().await.expect("active");
        harness.store.remove(active[0]).await.expect("reap");

        let status = settle(&controller).await;
        assert_eq!(
            status,
            RunStatus::Settled {
                completed: 0,
                unfinished: 1,
                expected: 1
            }
        );
        assert_eq!(harness.metrics.snapshot().jobs_completed, 0);
    }

    #[tokio::test]
    async fn hung_handler_is_abandoned_and_settles_run() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["ok", "stuck"]).await;
        let mut handler = ScriptedHandler::new();
        handler.hanging = vec!["stuck".into()];
        let controller =
            harness.controller_with(Arc::new(handler), 2, Duration::from_millis(100));

        controller.process_all_queues(&[handle]);
        let status = settle(&controller).await;

        assert_eq!(
            status,
            RunStatus::Settled {
                completed: 1,
                unfinished: 1,
                expected: 2
            }
        );
        let counts = harness.store.counts().await.expect("counts");
        assert_eq!(counts.active, 0);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn panicking_handler_fails_job_without_losing_worker() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["boom", "a", "b"]).await;
        let mut handler = ScriptedHandler::new();
        handler.panicking = vec!["boom".into()];
        let handler = Arc::new(handler);
        let controller = harness.controller(handler.clone(), 3);

        controller.process_all_queues(&[handle]);
        let status = settle(&controller).await;

        assert_eq!(
            status,
            RunStatus::Settled {
                completed: 2,
                unfinished: 1,
                expected: 3
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(harness.store.counts().await.expect("counts").failed, 1);
        assert_eq!(harness.metrics.snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn job_dead_lettered_in_flight_is_counted_as_lost() {
        let harness = Harness::new();
        let handle = harness.enqueue(&["slow"]).await;
        let mut handler = ScriptedHandler::new();
        handler.delay = Duration::from_millis(80);
        let controller = harness.controller(Arc::new(handler), 1);

        controller.process_all_queues(&[handle]);
        sleep(Duration::from_millis(20)).await;
        let active = harness.store.list_active().await.expect("active");
        harness
            .store
            .fail(active[0], "dead-lettered")
            .await
            .expect("dead-letter");

        let status = settle(&controller).await;
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
    async fn child_queues_are_matched_to_own_parent_queues() {
        let harness = Harness::new();
        harness
            .store
            .ensure_queue("obra-x-poesia:children")
            .await
            .expect("foreign child queue");
        harness
            .store
            .ensure_queue("obra-poesia:children")
            .await
            .expect("own child queue");
        let handle = harness.enqueue(&["slow"]).await;
        let mut handler = ScriptedHandler::new();
        handler.delay = Duration::from_millis(100);
        let controller = harness.controller(Arc::new(handler), 1);

        controller.process_all_queues(&[handle]);
        assert_eq!(controller.process_all_child_queues().await.expect("scan"), 1);
        assert_eq!(controller.process_all_child_queues().await.expect("scan"), 0);
        assert!(!lock(&controller.attached).contains("obra-x-poesia:children"));

        settle(&controller).await;
    }

    #[tokio::test]
    async fn zero_target_attaches_no_workers() {
        let harness = Harness::new();
        let handle = harness.enqueue(&[]).await;
        let controller = harness.controller(Arc::new(ScriptedHandler::new()), 0);
        assert_eq!(controller.process_all_queues(&[handle]), 0);
        assert!(!controller.is_running());
        settle(&controller).await;
    }
}
