//! Task queue storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{to_chrono, ClaimedTask, LeaseToken, Task, TaskId, TaskInfo, TaskState};

/// Durable task queue.
///
/// Claims are leases: a claimed task is invisible to other workers until its
/// lease expires, after which the next claim pass returns it to pending.
/// `complete`, `retry` and `kill` must present the current lease token and
/// fail with [`QueueError::LeaseLost`] otherwise, so at most one claim per
/// task is ever honoured. A holder that is still working keeps its claim
/// alive with [`TaskQueue::extend`].
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError>;

    /// Leases the earliest ready task of `queue`, if any.
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedTask>, QueueError>;

    /// Moves the lease deadline of a claimed task to `lease` from now and
    /// returns the new deadline.
    async fn extend(
        &self,
        claimed: &ClaimedTask,
        lease: Duration,
    ) -> Result<DateTime<Utc>, QueueError>;

    /// Deletes a successfully processed task.
    async fn complete(&self, claimed: &ClaimedTask) -> Result<(), QueueError>;

    /// Reschedules a failed task at `process_at` and bumps its retry count.
    async fn retry(
        &self,
        claimed: &ClaimedTask,
        error: &str,
        process_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Moves a task to the dead set.
    async fn kill(&self, claimed: &ClaimedTask, error: &str) -> Result<(), QueueError>;

    /// Looks up a pending, active or dead task. Completed tasks are gone.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError>;

    /// Most recently killed tasks of `queue`, newest first.
    async fn dead_tasks(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;
}

/// Task queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("lease lost for task {0}")]
    LeaseLost(TaskId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub dead: usize,
}

#[derive(Debug)]
struct Slot {
    task: Task,
    lease: Option<(LeaseToken, DateTime<Utc>)>,
}

/// In-memory task queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<HashMap<TaskId, Slot>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Slot>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds the slot for a leased task, checking the lease token.
    fn leased<'a>(
        tasks: &'a mut HashMap<TaskId, Slot>,
        claimed: &ClaimedTask,
    ) -> Result<&'a mut Slot, QueueError> {
        let id = claimed.task.id;
        let slot = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match slot.lease {
            Some((token, _)) if token == claimed.lease => Ok(slot),
            _ => Err(QueueError::LeaseLost(id)),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&task.id) {
            return Err(QueueError::AlreadyExists(task.id));
        }
        let info = task.info();
        tasks.insert(task.id, Slot { task, lease: None });
        Ok(info)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedTask>, QueueError> {
        let mut tasks = self.tasks();
        let now = Utc::now();

        // Expired leases go back to pending first.
        for slot in tasks.values_mut() {
            if slot.task.queue != queue {
                continue;
            }
            if let Some((_, expires_at)) = slot.lease {
                if expires_at <= now {
                    slot.lease = None;
                    slot.task.state = TaskState::Pending;
                    slot.task.not_before = now;
                }
            }
        }

        let next = tasks
            .values()
            .filter(|s| s.task.queue == queue && s.task.is_ready(now))
            .min_by_key(|s| (s.task.not_before, s.task.id))
            .map(|s| s.task.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let slot = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let token = LeaseToken::new();
        let expires_at = now + to_chrono(lease);
        slot.lease = Some((token, expires_at));
        slot.task.state = TaskState::Active;

        Ok(Some(ClaimedTask {
            task: slot.task.clone(),
            lease: token,
            lease_expires_at: expires_at,
        }))
    }

    async fn extend(
        &self,
        claimed: &ClaimedTask,
        lease: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let mut tasks = self.tasks();
        let slot = Self::leased(&mut tasks, claimed)?;
        let expires_at = Utc::now() + to_chrono(lease);
        slot.lease = Some((claimed.lease, expires_at));
        Ok(expires_at)
    }

    async fn complete(&self, claimed: &ClaimedTask) -> Result<(), QueueError> {
        let mut tasks = self.tasks();
        Self::leased(&mut tasks, claimed)?;
        tasks.remove(&claimed.task.id);
        Ok(())
    }

    async fn retry(
        &self,
        claimed: &ClaimedTask,
        error: &str,
        process_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut tasks = self.tasks();
        let slot = Self::leased(&mut tasks, claimed)?;
        slot.lease = None;
        slot.task.mark_retry(error, process_at);
        Ok(())
    }

    async fn kill(&self, claimed: &ClaimedTask, error: &str) -> Result<(), QueueError> {
        let mut tasks = self.tasks();
        let slot = Self::leased(&mut tasks, claimed)?;
        slot.lease = None;
        slot.task.mark_dead(error, Utc::now());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.tasks().get(&id).map(|s| s.task.clone()))
    }

    async fn dead_tasks(&self, queue: &str, limit: usize) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks();
        let mut dead: Vec<Task> = tasks
            .values()
            .filter(|s| s.task.queue == queue && s.task.state == TaskState::Dead)
            .map(|s| s.task.clone())
            .collect();
        dead.sort_by(|a, b| b.died_at.cmp(&a.died_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let tasks = self.tasks();
        let mut stats = QueueStats::default();
        for slot in tasks.values().filter(|s| s.task.queue == queue) {
            match slot.task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Active => stats.active += 1,
                TaskState::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}
