//! Queue Router: one named queue per formatted batch.

use crate::metrics::PipelineMetrics;
use crate::pipeline::types::{ChildConversionJob, FormattedBatch};
use crate::queue::{
    ConversionJob, JobId, JobKind, QueueError, QueueHandle, QueueStore, child_queue_name,
    is_child_queue, queue_name,
};
use std::sync::Arc;
use uuid::Uuid;

/// Turns formatted batches into queued conversion jobs.
pub struct QueueRouter {
    store: Arc<dyn QueueStore>,
    metrics: Arc<PipelineMetrics>,
}

impl QueueRouter {
    /// Create a router writing to `store`.
    pub fn new(store: Arc<dyn QueueStore>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Resolve `name` and enqueue one job per record of `batch`, in record order.
    ///
    /// `index` is the batch position within the run and only feeds diagnostics. Enqueueing the
    /// same batch twice yields the same handle and duplicate jobs.
    pub async fn create_queue(
        &self,
        run_id: Uuid,
        batch: &FormattedBatch,
        name: &str,
        index: usize,
    ) -> Result<QueueHandle, QueueError> {
        let handle = self.store.ensure_queue(name).await?;
        for (position, record) in batch.records.iter().enumerate() {
            let job = ConversionJob::new(
                run_id,
                handle.name.clone(),
                position,
                JobKind::Conversion,
                record.clone(),
            );
            self.store.enqueue(job).await?;
            self.metrics.record_enqueued(1);
        }
        tracing::info!(
            queue = %handle.name,
            batch = index,
            jobs = batch.records.len(),
            "Batch enqueued"
        );
        Ok(handle)
    }

    /// Route every batch of a run to `"{collection}-{category}"`, returning the distinct
    /// handles in batch order.
    pub async fn route_batches(
        &self,
        run_id: Uuid,
        collection: &str,
        batches: &[FormattedBatch],
    ) -> Result<Vec<QueueHandle>, QueueError> {
        let mut handles: Vec<QueueHandle> = Vec::with_capacity(batches.len());
        for (index, batch) in batches.iter().enumerate() {
            let name = queue_name(collection, &batch.category);
            let handle = self.create_queue(run_id, batch, &name, index).await?;
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Enqueue one child job spawned by `parent`. Children of a child stay in the same child
    /// queue.
    pub async fn enqueue_child(
        &self,
        run_id: Uuid,
        parent_queue: &str,
        child: ChildConversionJob,
    ) -> Result<JobId, QueueError> {
        let name = if is_child_queue(parent_queue) {
            parent_queue.to_string()
        } else {
            child_queue_name(parent_queue)
        };
        self.store.ensure_queue(&name).await?;
        let job = ConversionJob::new(
            run_id,
            name,
            child.index,
            JobKind::ChildConversion {
                parent: child.parent,
            },
            child.record,
        );
        let id = self.store.enqueue(job).await?;
        self.metrics.record_enqueued(1);
        Ok(id)
    }
}
