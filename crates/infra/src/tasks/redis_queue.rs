//! Redis-backed task queue.
//!
//! Layout, for namespace `ns`:
//!
//! | key                    | type | contents                                   |
//! |------------------------|------|--------------------------------------------|
//! | `{ns}:t:<id>`          | hash | `msg` (task JSON), `lease` (current token) |
//! | `{ns}:<queue>:pending` | zset | task ids scored by `not_before` ms         |
//! | `{ns}:<queue>:active`  | zset | task ids scored by lease deadline ms       |
//! | `{ns}:<queue>:dead`    | zset | task ids scored by time of death ms        |
//!
//! Every state change is a Lua script so that the lease check and the move
//! between sets happen atomically.
//!
//! The claim script reclaims expired leases and so writes task hashes it
//! only learns about from the active set. Those keys cannot be declared up
//! front. The braces around the namespace are a Redis Cluster hash tag,
//! which places every key of a namespace in one slot so the script stays
//! valid on a cluster. The cost is that one namespace lives on one shard.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};
use tracing::{debug, instrument};

use super::store::{QueueError, QueueStats, TaskQueue};
use super::types::{to_chrono, ClaimedTask, LeaseToken, Task, TaskId, TaskInfo, TaskState};

const ENQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1])
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

// KEYS: pending, active. ARGV: now, lease deadline, token, task key prefix.
const CLAIM: &str = r#"
local expired = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1])
for _, id in ipairs(expired) do
  redis.call("ZREM", KEYS[2], id)
  redis.call("HDEL", ARGV[4] .. id, "lease")
  redis.call("ZADD", KEYS[1], ARGV[1], id)
end
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
redis.call("ZREM", KEYS[1], id)
redis.call("ZADD", KEYS[2], ARGV[2], id)
redis.call("HSET", ARGV[4] .. id, "lease", ARGV[3])
return redis.call("HGET", ARGV[4] .. id, "msg")
"#;

// KEYS: task, active. ARGV: token, id, lease deadline.
const EXTEND: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return -1
end
if redis.call("HGET", KEYS[1], "lease") ~= ARGV[1] then
  return 0
end
redis.call("ZADD", KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

// KEYS: task, active. ARGV: token, id.
const COMPLETE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return -1
end
if redis.call("HGET", KEYS[1], "lease") ~= ARGV[1] then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[2])
redis.call("DEL", KEYS[1])
return 1
"#;

// KEYS: task, active, destination set. ARGV: token, id, msg, score.
const MOVE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return -1
end
if redis.call("HGET", KEYS[1], "lease") ~= ARGV[1] then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[2])
redis.call("HSET", KEYS[1], "msg", ARGV[3])
redis.call("HDEL", KEYS[1], "lease")
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[2])
return 1
"#;

struct Scripts {
    enqueue: Script,
    claim: Script,
    extend: Script,
    complete: Script,
    move_to: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            extend: Script::new(EXTEND),
            complete: Script::new(COMPLETE),
            move_to: Script::new(MOVE),
        }
    }
}

pub struct RedisTaskQueue {
    conn: MultiplexedConnection,
    namespace: String,
    scripts: Scripts,
}

impl RedisTaskQueue {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(storage)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(storage)?;
        Ok(Self::new(conn, namespace))
    }

    pub fn new(conn: MultiplexedConnection, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            scripts: Scripts::default(),
        }
    }

    fn task_prefix(&self) -> String {
        task_prefix(&self.namespace)
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    fn lane_key(&self, queue: &str, set: &str) -> String {
        lane_key(&self.namespace, queue, set)
    }

    async fn move_to(
        &self,
        claimed: &ClaimedTask,
        task: &Task,
        set: &str,
        score: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .scripts
            .move_to
            .key(self.task_key(task.id))
            .key(self.lane_key(&task.queue, "active"))
            .key(self.lane_key(&task.queue, set))
            .arg(claimed.lease.to_string())
            .arg(task.id.to_string())
            .arg(encode(task)?)
            .arg(score.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        lease_status(status, task.id)
    }

    async fn load(&self, id: TaskId) -> Result<Option<(Task, bool)>, QueueError> {
        let mut conn = self.conn.clone();
        let (msg, lease): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.task_key(id))
            .arg("msg")
            .arg("lease")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        match msg {
            Some(msg) => Ok(Some((decode(&msg)?, lease.is_some()))),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for RedisTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    #[instrument(skip_all, fields(task_id = %task.id, queue = %task.queue), err)]
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .scripts
            .enqueue
            .key(self.task_key(task.id))
            .key(self.lane_key(&task.queue, "pending"))
            .arg(encode(&task)?)
            .arg(task.not_before.timestamp_millis())
            .arg(task.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        if created == 0 {
            return Err(QueueError::AlreadyExists(task.id));
        }
        Ok(task.info())
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedTask>, QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let expires_at = now + to_chrono(lease);
        let token = LeaseToken::new();

        let msg: Option<String> = self
            .scripts
            .claim
            .key(self.lane_key(queue, "pending"))
            .key(self.lane_key(queue, "active"))
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(token.to_string())
            .arg(self.task_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        let Some(msg) = msg else {
            return Ok(None);
        };
        let mut task = decode(&msg)?;
        task.state = TaskState::Active;
        debug!(task_id = %task.id, queue, "leased task");

        Ok(Some(ClaimedTask {
            task,
            lease: token,
            lease_expires_at: expires_at,
        }))
    }

    #[instrument(skip_all, fields(task_id = %claimed.task.id), err)]
    async fn extend(
        &self,
        claimed: &ClaimedTask,
        lease: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let mut conn = self.conn.clone();
        let id = claimed.task.id;
        let expires_at = Utc::now() + to_chrono(lease);
        let status: i64 = self
            .scripts
            .extend
            .key(self.task_key(id))
            .key(self.lane_key(&claimed.task.queue, "active"))
            .arg(claimed.lease.to_string())
            .arg(id.to_string())
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        lease_status(status, id)?;
        Ok(expires_at)
    }

    #[instrument(skip_all, fields(task_id = %claimed.task.id), err)]
    async fn complete(&self, claimed: &ClaimedTask) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let id = claimed.task.id;
        let status: i64 = self
            .scripts
            .complete
            .key(self.task_key(id))
            .key(self.lane_key(&claimed.task.queue, "active"))
            .arg(claimed.lease.to_string())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        lease_status(status, id)
    }

    #[instrument(skip_all, fields(task_id = %claimed.task.id), err)]
    async fn retry(
        &self,
        claimed: &ClaimedTask,
        error: &str,
        process_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut task = claimed.task.clone();
        task.mark_retry(error, process_at);
        self.move_to(claimed, &task, "pending", process_at).await
    }

    #[instrument(skip_all, fields(task_id = %claimed.task.id), err)]
    async fn kill(&self, claimed: &ClaimedTask, error: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut task = claimed.task.clone();
        task.mark_dead(error, now);
        self.move_to(claimed, &task, "dead", now).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.load(id).await?.map(|(mut task, leased)| {
            if leased {
                task.state = TaskState::Active;
            }
            task
        }))
    }

    async fn dead_tasks(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.lane_key(queue, "dead"))
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let id: TaskId = id
                .parse()
                .map_err(|e: uuid::Error| QueueError::Serialization(e.to_string()))?;
            if let Some((task, _)) = self.load(id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("ZCARD")
            .arg(self.lane_key(queue, "pending"))
            .cmd("ZCARD")
            .arg(self.lane_key(queue, "active"))
            .cmd("ZCARD")
            .arg(self.lane_key(queue, "dead"));
        let (pending, active, dead): (usize, usize, usize) =
            pipe.query_async(&mut conn).await.map_err(storage)?;
        Ok(QueueStats {
            pending,
            active,
            dead,
        })
    }
}

fn task_prefix(namespace: &str) -> String {
    format!("{{{namespace}}}:t:")
}

fn lane_key(namespace: &str, queue: &str, set: &str) -> String {
    format!("{{{namespace}}}:{queue}:{set}")
}

fn storage(err: RedisError) -> QueueError {
    QueueError::Storage(err.to_string())
}

fn encode(task: &Task) -> Result<String, QueueError> {
    serde_json::to_string(task).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode(msg: &str) -> Result<Task, QueueError> {
    serde_json::from_str(msg).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn lease_status(status: i64, id: TaskId) -> Result<(), QueueError> {
    match status {
        1 => Ok(()),
        -1 => Err(QueueError::NotFound(id)),
        _ => Err(QueueError::LeaseLost(id)),
    }
}
