//! Producer side: serializes payloads and enqueues tasks.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::store::{QueueError, TaskQueue};
use super::types::{Task, TaskInfo, TaskOptions};
use super::verify_email::{SendVerifyEmailPayload, TASK_SEND_VERIFY_EMAIL};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to marshal task payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to enqueue task: {0}")]
    Queue(#[from] QueueError),
}

/// Enqueues tasks for [`TaskProcessor`](super::TaskProcessor) workers.
#[derive(Clone)]
pub struct TaskDistributor {
    queue: Arc<dyn TaskQueue>,
}

impl TaskDistributor {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Serializes `payload` as JSON and enqueues it under `task_type`.
    pub async fn dispatch<P>(
        &self,
        task_type: &str,
        payload: &P,
        options: TaskOptions,
    ) -> Result<TaskInfo, DispatchError>
    where
        P: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(payload)?;
        let task = Task::new(task_type, payload, &options);
        let info = self.queue.enqueue(task).await?;

        info!(
            task_type = %info.task_type,
            task_id = %info.id,
            queue = %info.queue,
            max_retry = info.max_retry,
            "enqueued task"
        );
        Ok(info)
    }

    pub async fn send_verify_email(
        &self,
        payload: &SendVerifyEmailPayload,
        options: TaskOptions,
    ) -> Result<TaskInfo, DispatchError> {
        self.dispatch(TASK_SEND_VERIFY_EMAIL, payload, options).await
    }
}

impl std::fmt::Debug for TaskDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDistributor").finish_non_exhaustive()
    }
}
