//! Durable queue store backed by Redis.
//!
//! Key layout under a configurable prefix:
//!
//! - `{prefix}:queues` – set of queue names.
//! - `{prefix}:queue:{name}:inactive` – list of pending job ids, oldest first.
//! - `{prefix}:active` / `{prefix}:failed` – sets of job ids per state.
//! - `{prefix}:job:{id}` – hash holding the serialized job (`data`) and its mutable fields
//!   (`queue`, `state`, `updated_at`, `attempts`, `error`).
//!
//! Every state transition runs as a Lua script so a claim, touch, completion, or reap is
//! atomic with respect to the others.

use crate::queue::store::QueueStore;
use crate::queue::types::{
    ConversionJob, JobCounts, JobId, JobState, QueueError, QueueHandle, now_millis,
};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use uuid::Uuid;

const ENQUEUE_SCRIPT: &str = r"
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
local previous = redis.call('HGET', KEYS[1], 'queue')
if previous then
  redis.call('LREM', ARGV[6] .. previous .. ':inactive', 0, ARGV[1])
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'data', ARGV[3], 'queue', ARGV[2], 'state', 'inactive',
  'updated_at', ARGV[4], 'attempts', ARGV[5])
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
return 1
";

const CLAIM_SCRIPT: &str = r"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return {}
  end
  local key = ARGV[1] .. id
  if redis.call('HGET', key, 'state') == 'inactive' then
    redis.call('HSET', key, 'state', 'active', 'updated_at', ARGV[2])
    redis.call('HINCRBY', key, 'attempts', 1)
    redis.call('SADD', KEYS[2], id)
    return redis.call('HGETALL', key)
  end
end
";

const TOUCH_SCRIPT: &str = r"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then
  return redis.call('EXISTS', KEYS[1]) - 1
end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
return 1
";

const COMPLETE_SCRIPT: &str = r"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return redis.call('EXISTS', KEYS[1]) - 1
end
redis.call('DEL', KEYS[1])
return 1
";

const FAIL_SCRIPT: &str = r"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return redis.call('EXISTS', KEYS[1]) - 1
end
redis.call('HSET', KEYS[1], 'state', 'failed', 'updated_at', ARGV[2], 'error', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
";

const REMOVE_SCRIPT: &str = r"
local queue = redis.call('HGET', KEYS[1], 'queue')
if not queue then
  return 0
end
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('LREM', ARGV[2] .. queue .. ':inactive', 0, ARGV[1])
redis.call('DEL', KEYS[1])
return 1
";

const REQUEUE_SCRIPT: &str = r"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return redis.call('EXISTS', KEYS[1]) - 1
end
local queue = redis.call('HGET', KEYS[1], 'queue')
redis.call('HSET', KEYS[1], 'state', 'inactive', 'updated_at', ARGV[3])
redis.call('HDEL', KEYS[1], 'error')
redis.call('RPUSH', ARGV[2] .. queue .. ':inactive', ARGV[1])
return 1
";

/// Outcome codes shared by the transition scripts.
const TRANSITIONED: i64 = 1;
const WRONG_STATE: i64 = 0;

struct Scripts {
    enqueue: Script,
    claim: Script,
    touch: Script,
    complete: Script,
    fail: Script,
    remove: Script,
    requeue: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
        }
    }
}

/// Queue store persisting jobs in Redis so they survive process restarts.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    prefix: String,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisQueueStore {
    /// Connect to Redis and prepare the transition scripts.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(prefix, "Connected durable queue store");
        Ok(Self {
            conn,
            prefix: prefix.trim_end_matches(':').to_string(),
            scripts: std::sync::Arc::new(Scripts::load()),
        })
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn queue_key_prefix(&self) -> String {
        format!("{}:queue:", self.prefix)
    }

    fn inactive_key(&self, queue: &str) -> String {
        format!("{}{queue}:inactive", self.queue_key_prefix())
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}{id}", self.job_key_prefix())
    }

    /// Map a transition script result onto the trait contract.
    fn transition_result(
        &self,
        id: JobId,
        code: i64,
        expected: JobState,
        actual: Option<JobState>,
    ) -> Result<(), QueueError> {
        match (code, actual) {
            (TRANSITIONED, _) => Ok(()),
            (WRONG_STATE, Some(state)) => Err(QueueError::InvalidState {
                id,
                state,
                expected,
            }),
            _ => Err(QueueError::NotFound(id)),
        }
    }

    async fn current_state(&self, id: JobId) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.conn.clone();
        let state: Option<String> = redis::cmd("HGET")
            .arg(self.job_key(id))
            .arg("state")
            .query_async(&mut conn)
            .await?;
        Ok(state.as_deref().and_then(JobState::parse))
    }
}

/// Rebuild a job from its Redis hash.
fn decode_job(fields: HashMap<String, String>) -> Result<ConversionJob, QueueError> {
    let data = fields
        .get("data")
        .ok_or_else(|| QueueError::Corrupt("job hash without data".into()))?;
    let mut job: ConversionJob = serde_json::from_str(data)?;
    if let Some(state) = fields.get("state").and_then(|value| JobState::parse(value)) {
        job.state = state;
    }
    if let Some(updated_at) = fields.get("updated_at").and_then(|value| value.parse().ok()) {
        job.updated_at = updated_at;
    }
    if let Some(attempts) = fields.get("attempts").and_then(|value| value.parse().ok()) {
        job.attempts = attempts;
    }
    if let Some(queue) = fields.get("queue") {
        job.queue = queue.clone();
    }
    job.error = fields.get("error").cloned();
    Ok(job)
}

fn pairs_to_map(pairs: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(pairs.len() / 2);
    let mut iter = pairs.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        map.insert(key, value);
    }
    map
}

fn parse_ids(raw: Vec<String>) -> Vec<JobId> {
    raw.into_iter()
        .filter_map(|value| match Uuid::parse_str(&value) {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::warn!(value, error = %error, "Skipping malformed job id");
                None
            }
        })
        .collect()
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn ensure_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        let mut conn = self.conn.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(self.queues_key())
            .arg(name)
            .query_async(&mut conn)
            .await?;
        if added > 0 {
            tracing::debug!(queue = name, "Queue created");
        }
        Ok(QueueHandle {
            name: name.to_string(),
        })
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.queues_key())
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }

    async fn enqueue(&self, job: ConversionJob) -> Result<JobId, QueueError> {
        let mut conn = self.conn.clone();
        let id = job.id;
        let mut stored = job;
        stored.state = JobState::Inactive;
        stored.error = None;
        let data = serde_json::to_string(&stored)?;
        let _: i64 = self
            .scripts
            .enqueue
            .key(self.job_key(id))
            .key(self.inactive_key(&stored.queue))
            .key(self.queues_key())
            .key(self.active_key())
            .key(self.failed_key())
            .arg(id.to_string())
            .arg(&stored.queue)
            .arg(data)
            .arg(now_millis())
            .arg(stored.attempts)
            .arg(self.queue_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<ConversionJob>, QueueError> {
        let mut conn = self.conn.clone();
        let pairs: Vec<String> = self
            .scripts
            .claim
            .key(self.inactive_key(queue))
            .key(self.active_key())
            .arg(self.job_key_prefix())
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        if pairs.is_empty() {
            return Ok(None);
        }
        decode_job(pairs_to_map(pairs)).map(Some)
    }

    async fn touch(&self, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .touch
            .key(self.job_key(id))
            .key(self.active_key())
            .arg(id.to_string())
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        let actual = if code == WRONG_STATE {
            self.current_state(id).await?
        } else {
            None
        };
        self.transition_result(id, code, JobState::Active, actual)
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .complete
            .key(self.job_key(id))
            .key(self.active_key())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        let actual = if code == WRONG_STATE {
            self.current_state(id).await?
        } else {
            None
        };
        self.transition_result(id, code, JobState::Active, actual)
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .fail
            .key(self.job_key(id))
            .key(self.active_key())
            .key(self.failed_key())
            .arg(id.to_string())
            .arg(now_millis())
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;
        let actual = if code == WRONG_STATE {
            self.current_state(id).await?
        } else {
            None
        };
        self.transition_result(id, code, JobState::Active, actual)
    }

    async fn list_active(&self) -> Result<Vec<JobId>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.active_key())
            .query_async(&mut conn)
            .await?;
        Ok(parse_ids(raw))
    }

    async fn get(&self, id: JobId) -> Result<ConversionJob, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Err(QueueError::NotFound(id));
        }
        decode_job(fields)
    }

    async fn remove(&self, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .remove
            .key(self.job_key(id))
            .key(self.active_key())
            .key(self.failed_key())
            .arg(id.to_string())
            .arg(self.queue_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        if removed == TRANSITIONED {
            Ok(())
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    async fn requeue(&self, id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .requeue
            .key(self.job_key(id))
            .key(self.failed_key())
            .arg(id.to_string())
            .arg(self.queue_key_prefix())
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        let actual = if code == WRONG_STATE {
            self.current_state(id).await?
        } else {
            None
        };
        self.transition_result(id, code, JobState::Failed, actual)
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let queues = self.list_queues().await?;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        for queue in &queues {
            pipe.cmd("LLEN").arg(self.inactive_key(queue));
        }
        pipe.cmd("SCARD").arg(self.active_key());
        pipe.cmd("SCARD").arg(self.failed_key());
        let mut lengths: Vec<usize> = pipe.query_async(&mut conn).await?;

        let failed = lengths.pop().unwrap_or_default();
        let active = lengths.pop().unwrap_or_default();
        Ok(JobCounts {
            queues: queues.len(),
            inactive: lengths.into_iter().sum(),
            active,
            failed,
        })
    }
}
