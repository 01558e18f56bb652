//! Durable named job queues shared by the router, the drain controller, and the watchdog.

pub mod memory;
pub mod redis_store;
mod store;
pub mod types;

pub use memory::MemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use store::QueueStore;
pub use types::{
    ConversionJob, JobCounts, JobId, JobKind, JobState, QueueError, QueueHandle,
    child_queue_name, is_child_queue, now_millis, queue_name,
};
