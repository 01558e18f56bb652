use std::env;

use discovery_reindexer::{
    pipeline::FormattedRecord,
    queue::{ConversionJob, JobKind, JobState, QueueError, QueueStore, RedisQueueStore},
};
use serde_json::Map;
use uuid::Uuid;

fn redis_url() -> String {
    env::var("REDIS_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string())
}

/// Fresh key prefix per test so runs never see each other's jobs.
async fn store() -> RedisQueueStore {
    let prefix = format!("reindex-test-{}", Uuid::new_v4());
    RedisQueueStore::connect(&redis_url(), &prefix)
        .await
        .expect("failed to connect to Redis")
}

fn job(queue: &str, index: usize) -> ConversionJob {
    ConversionJob::new(
        Uuid::new_v4(),
        queue,
        index,
        JobKind::Conversion,
        FormattedRecord {
            document_id: format!("doc-{index}"),
            category: "poesia".into(),
            fields: Map::new(),
            children: Vec::new(),
        },
    )
}

#[tokio::test]
#[ignore = "Requires live Redis"]
async fn live_redis_job_lifecycle() {
    let store = store().await;
    store.ensure_queue("obra-poesia").await.expect("queue");
    let first = store.enqueue(job("obra-poesia", 0)).await.expect("enqueue");
    let second = store.enqueue(job("obra-poesia", 1)).await.expect("enqueue");

    let claimed = store
        .claim_next("obra-poesia")
        .await
        .expect("claim")
        .expect("job");
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(store.list_active().await.expect("active"), vec![first]);

    store.touch(first).await.expect("touch");
    store.complete(first).await.expect("complete");
    assert!(matches!(store.get(first).await, Err(QueueError::NotFound(_))));

    store.claim_next("obra-poesia").await.expect("claim");
    store.fail(second, "rejected").await.expect("fail");
    let failed = store.get(second).await.expect("job");
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error.as_deref(), Some("rejected"));

    store.requeue(second).await.expect("requeue");
    let again = store
        .claim_next("obra-poesia")
        .await
        .expect("claim")
        .expect("job");
    assert_eq!(again.id, second);
    assert_eq!(again.attempts, 2);
    store.remove(second).await.expect("remove");

    let counts = store.counts().await.expect("counts");
    assert_eq!(counts.queues, 1);
    assert_eq!(counts.inactive + counts.active + counts.failed, 0);
}

#[tokio::test]
#[ignore = "Requires live Redis"]
async fn live_redis_reaped_job_cannot_be_completed() {
    let store = store().await;
    let id = store.enqueue(job("obra-teatro", 0)).await.expect("enqueue");
    store.claim_next("obra-teatro").await.expect("claim");

    store.remove(id).await.expect("reap");
    assert!(matches!(store.touch(id).await, Err(QueueError::NotFound(_))));
    assert!(matches!(store.complete(id).await, Err(QueueError::NotFound(_))));
    assert!(store.list_active().await.expect("active").is_empty());
}
