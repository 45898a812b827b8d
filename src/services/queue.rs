//! Task dispatch with at-least-once delivery.
//!
//! A dequeued task stays in flight until the worker acknowledges it after its
//! task function returns. A worker that dies (or overruns the hard deadline)
//! loses its delivery lease, and the task is handed out again until
//! `max_deliveries` is reached, after which it is dead-lettered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::models::task::{TaskHandle, TaskState, TaskStateKind};

const QUEUE_KEY: &str = "step_render:tasks";
const IN_FLIGHT_KEY: &str = "step_render:in_flight";
const DEAD_LETTER_KEY: &str = "step_render:dead_letter";
const LEASE_PREFIX: &str = "step_render:lease:";
const RESULT_PREFIX: &str = "step_render:result:";

/// Atomically move the oldest pending task in flight and take its lease.
const DEQUEUE_SCRIPT: &str = r#"
local payload = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not payload then
  return false
end
local task = cjson.decode(payload)
redis.call('SET', ARGV[1] .. task.task_id, ARGV[2], 'EX', ARGV[3])
return payload
"#;

/// Execution limits and delivery policy shared by the dispatcher and workers.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    hard_time_limit: Duration,
    soft_time_limit: Duration,
    max_tasks_per_worker: u32,
    result_expires: Duration,
    delivery_lease: Duration,
    max_deliveries: u32,
}

impl DispatchPolicy {
    pub fn new(
        hard_time_limit: Duration,
        soft_time_limit: Duration,
        max_tasks_per_worker: u32,
        result_expires: Duration,
        delivery_lease: Duration,
        max_deliveries: u32,
    ) -> Result<Self, ConfigError> {
        if soft_time_limit >= hard_time_limit {
            return Err(ConfigError::SoftLimitNotBelowHard {
                soft: soft_time_limit.as_secs(),
                hard: hard_time_limit.as_secs(),
            });
        }
        if delivery_lease.is_zero() {
            return Err(ConfigError::Zero("delivery lease"));
        }
        if delivery_lease >= hard_time_limit {
            return Err(ConfigError::LeaseTooLong {
                lease: delivery_lease.as_secs(),
                hard: hard_time_limit.as_secs(),
            });
        }
        if max_tasks_per_worker == 0 {
            return Err(ConfigError::Zero("max tasks per worker"));
        }
        if max_deliveries == 0 {
            return Err(ConfigError::Zero("max deliveries"));
        }
        if result_expires.is_zero() {
            return Err(ConfigError::Zero("result expiry"));
        }

        Ok(Self {
            hard_time_limit,
            soft_time_limit,
            max_tasks_per_worker,
            result_expires,
            delivery_lease,
            max_deliveries,
        })
    }

    /// Wall-clock limit after which a job's execution is terminated.
    pub fn hard_time_limit(&self) -> Duration {
        self.hard_time_limit
    }

    /// Wall-clock limit after which a warning is logged.
    pub fn soft_time_limit(&self) -> Duration {
        self.soft_time_limit
    }

    /// Jobs a worker takes at a time.
    pub fn prefetch(&self) -> u32 {
        1
    }

    pub fn max_tasks_per_worker(&self) -> u32 {
        self.max_tasks_per_worker
    }

    pub fn result_expires(&self) -> Duration {
        self.result_expires
    }

    pub fn delivery_lease(&self) -> Duration {
        self.delivery_lease
    }

    /// Interval at which a running job refreshes its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.delivery_lease / 3).max(Duration::from_millis(10))
    }

    pub fn max_deliveries(&self) -> u32 {
        self.max_deliveries
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            hard_time_limit: Duration::from_secs(600),
            soft_time_limit: Duration::from_secs(540),
            max_tasks_per_worker: 50,
            result_expires: Duration::from_secs(3600),
            delivery_lease: Duration::from_secs(60),
            max_deliveries: 5,
        }
    }
}

/// Task payload serialized into the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedTask {
    pub task_id: TaskHandle,
    pub job_id: Uuid,
    /// Deliveries that ended without acknowledgement
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    fn new(job_id: Uuid) -> Self {
        Self {
            task_id: TaskHandle::generate(),
            job_id,
            deliveries: 0,
            enqueued_at: Utc::now(),
        }
    }

    fn redelivery(&self) -> Self {
        Self {
            deliveries: self.deliveries + 1,
            ..self.clone()
        }
    }
}

/// One in-flight delivery of a task.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: QueuedTask,
    payload: String,
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        self.task.job_id
    }

    pub fn task_id(&self) -> &TaskHandle {
        &self.task.task_id
    }

    /// 1-based attempt number of this delivery.
    pub fn attempt(&self) -> u32 {
        self.task.deliveries + 1
    }
}

/// What happened to a delivery that ended without acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectOutcome {
    Redelivered { attempt: u32 },
    DeadLettered,
    /// Another party (ack or reaper) already settled the delivery.
    AlreadySettled,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a conversion of `job_id`; returns immediately with its handle.
    async fn enqueue(&self, job_id: Uuid) -> Result<TaskHandle, QueueError>;

    /// Take the next pending task, if any, and lease it to the caller.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Extend the lease of a running delivery.
    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledge a delivery whose task function returned, recording its outcome.
    async fn ack(&self, delivery: &Delivery, outcome: TaskState) -> Result<(), QueueError>;

    /// Settle a delivery as failed: redeliver it or dead-letter it.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<RejectOutcome, QueueError>;

    /// Reject every in-flight delivery whose lease lapsed.
    async fn reap_expired(&self) -> Result<Vec<(QueuedTask, RejectOutcome)>, QueueError>;

    /// Live execution state of a task handle from the result backend.
    async fn task_state(&self, handle: &TaskHandle) -> Result<Option<TaskState>, QueueError>;

    /// Number of pending (not in-flight) tasks.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Delivery lease for task {0} was lost")]
    LeaseLost(TaskHandle),

    #[error("Queue unavailable")]
    Unavailable,
}

fn lease_key(handle: &TaskHandle) -> String {
    format!("{LEASE_PREFIX}{handle}")
}

fn result_key(handle: &TaskHandle) -> String {
    format!("{RESULT_PREFIX}{handle}")
}

fn dead_letter_state(task: &QueuedTask, reason: &str) -> TaskState {
    TaskState::failed(format!(
        "Delivery attempts exhausted after {} tries: {reason}",
        task.deliveries + 1
    ))
}

/// Redis-backed task queue and result backend.
pub struct RedisTaskQueue {
    client: redis::Client,
    policy: DispatchPolicy,
    worker_name: String,
}

impl RedisTaskQueue {
    pub fn new(redis_url: &str, policy: DispatchPolicy) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let worker_name = format!("worker-{}", std::process::id());
        Ok(Self {
            client,
            policy,
            worker_name,
        })
    }

    async fn store_state(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        handle: &TaskHandle,
        state: &TaskState,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(state)?;
        conn.set_ex::<_, _, ()>(result_key(handle), payload, self.policy.result_expires().as_secs())
            .await?;
        Ok(())
    }

    async fn settle_failed(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task: &QueuedTask,
        payload: &str,
        reason: &str,
    ) -> Result<RejectOutcome, QueueError> {
        let removed: i64 = conn.lrem(IN_FLIGHT_KEY, 1, payload).await?;
        if removed == 0 {
            return Ok(RejectOutcome::AlreadySettled);
        }

        let next = task.redelivery();
        if next.deliveries >= self.policy.max_deliveries() {
            let dead = serde_json::to_string(&next)?;
            redis::pipe()
                .atomic()
                .lpush(DEAD_LETTER_KEY, dead)
                .ignore()
                .del(lease_key(&task.task_id))
                .ignore()
                .query_async::<()>(conn)
                .await?;
            self.store_state(conn, &task.task_id, &dead_letter_state(task, reason))
                .await?;
            return Ok(RejectOutcome::DeadLettered);
        }

        let requeued = serde_json::to_string(&next)?;
        redis::pipe()
            .atomic()
            .lpush(QUEUE_KEY, requeued)
            .ignore()
            .del(lease_key(&task.task_id))
            .ignore()
            .query_async::<()>(conn)
            .await?;
        let mut retry = TaskState::new(TaskStateKind::Retry);
        retry.error = Some(reason.to_string());
        self.store_state(conn, &task.task_id, &retry).await?;

        Ok(RejectOutcome::Redelivered {
            attempt: next.deliveries + 1,
        })
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<TaskHandle, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let task = QueuedTask::new(job_id);
        let payload = serde_json::to_string(&task)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        self.store_state(&mut conn, &task.task_id, &TaskState::new(TaskStateKind::Pending))
            .await?;
        Ok(task.task_id)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = redis::Script::new(DEQUEUE_SCRIPT)
            .key(QUEUE_KEY)
            .key(IN_FLIGHT_KEY)
            .arg(LEASE_PREFIX)
            .arg(&self.worker_name)
            .arg(self.policy.delivery_lease().as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let task: QueuedTask = serde_json::from_str(&payload)?;
        self.store_state(&mut conn, &task.task_id, &TaskState::new(TaskStateKind::Started))
            .await?;
        Ok(Some(Delivery { task, payload }))
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let refreshed: Option<String> = redis::cmd("SET")
            .arg(lease_key(delivery.task_id()))
            .arg(&self.worker_name)
            .arg("EX")
            .arg(self.policy.delivery_lease().as_secs().max(1))
            .arg("XX")
            .query_async(&mut conn)
            .await?;

        match refreshed {
            Some(_) => Ok(()),
            None => Err(QueueError::LeaseLost(delivery.task_id().clone())),
        }
    }

    async fn ack(&self, delivery: &Delivery, outcome: TaskState) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .atomic()
            .lrem(IN_FLIGHT_KEY, 1, &delivery.payload)
            .ignore()
            .del(lease_key(delivery.task_id()))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        self.store_state(&mut conn, delivery.task_id(), &outcome).await
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<RejectOutcome, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.settle_failed(&mut conn, &delivery.task, &delivery.payload, reason)
            .await
    }

    async fn reap_expired(&self) -> Result<Vec<(QueuedTask, RejectOutcome)>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let in_flight: Vec<String> = conn.lrange(IN_FLIGHT_KEY, 0, -1).await?;
        let mut settled = Vec::new();

        for payload in in_flight {
            let task: QueuedTask = match serde_json::from_str(&payload) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(error = %e, "Dropping malformed in-flight task payload");
                    conn.lrem::<_, _, ()>(IN_FLIGHT_KEY, 1, &payload).await?;
                    continue;
                }
            };

            let leased: bool = conn.exists(lease_key(&task.task_id)).await?;
            if leased {
                continue;
            }

            let outcome = self
                .settle_failed(&mut conn, &task, &payload, "worker lost")
                .await?;
            if outcome != RejectOutcome::AlreadySettled {
                settled.push((task, outcome));
            }
        }

        Ok(settled)
    }

    async fn task_state(&self, handle: &TaskHandle) -> Result<Option<TaskState>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.get(result_key(handle)).await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    pending: VecDeque<QueuedTask>,
    in_flight: HashMap<TaskHandle, (QueuedTask, Instant)>,
    dead_letters: Vec<QueuedTask>,
    results: HashMap<TaskHandle, TaskState>,
}

/// In-process task queue with the same delivery semantics as the Redis queue.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    policy: DispatchPolicy,
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    pub fn dead_letters(&self) -> Vec<QueuedTask> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryQueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Unavailable)
    }

    fn settle_failed(
        &self,
        state: &mut MemoryQueueState,
        task: &QueuedTask,
        reason: &str,
    ) -> RejectOutcome {
        if state.in_flight.remove(&task.task_id).is_none() {
            return RejectOutcome::AlreadySettled;
        }

        let next = task.redelivery();
        if next.deliveries >= self.policy.max_deliveries() {
            state
                .results
                .insert(task.task_id.clone(), dead_letter_state(task, reason));
            state.dead_letters.push(next);
            return RejectOutcome::DeadLettered;
        }

        let mut retry = TaskState::new(TaskStateKind::Retry);
        retry.error = Some(reason.to_string());
        state.results.insert(task.task_id.clone(), retry);
        let attempt = next.deliveries + 1;
        state.pending.push_back(next);
        RejectOutcome::Redelivered { attempt }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<TaskHandle, QueueError> {
        let task = QueuedTask::new(job_id);
        let handle = task.task_id.clone();
        let mut state = self.lock()?;
        state
            .results
            .insert(handle.clone(), TaskState::new(TaskStateKind::Pending));
        state.pending.push_back(task);
        Ok(handle)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock()?;
        let Some(task) = state.pending.pop_front() else {
            return Ok(None);
        };

        let payload = serde_json::to_string(&task)?;
        let lease_until = Instant::now() + self.policy.delivery_lease();
        state
            .in_flight
            .insert(task.task_id.clone(), (task.clone(), lease_until));
        state
            .results
            .insert(task.task_id.clone(), TaskState::new(TaskStateKind::Started));
        Ok(Some(Delivery { task, payload }))
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        match state.in_flight.get_mut(delivery.task_id()) {
            Some((_, lease_until)) => {
                *lease_until = Instant::now() + self.policy.delivery_lease();
                Ok(())
            }
            None => Err(QueueError::LeaseLost(delivery.task_id().clone())),
        }
    }

    async fn ack(&self, delivery: &Delivery, outcome: TaskState) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.in_flight.remove(delivery.task_id());
        state.results.insert(delivery.task_id().clone(), outcome);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<RejectOutcome, QueueError> {
        let mut state = self.lock()?;
        Ok(self.settle_failed(&mut state, &delivery.task, reason))
    }

    async fn reap_expired(&self) -> Result<Vec<(QueuedTask, RejectOutcome)>, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let expired: Vec<QueuedTask> = state
            .in_flight
            .values()
            .filter(|(_, lease_until)| *lease_until <= now)
            .map(|(task, _)| task.clone())
            .collect();

        Ok(expired
            .into_iter()
            .map(|task| {
                let outcome = self.settle_failed(&mut state, &task, "worker lost");
                (task, outcome)
            })
            .collect())
    }

    async fn task_state(&self, handle: &TaskHandle) -> Result<Option<TaskState>, QueueError> {
        Ok(self.lock()?.results.get(handle).cloned())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lock()?.pending.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.lock().map(|_| ())
    }
}
