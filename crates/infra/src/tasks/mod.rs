//! Background task queue.
//!
//! The producer side ([`TaskDistributor`]) serializes payloads and enqueues
//! them; the consumer side ([`TaskProcessor`]) leases tasks from weighted
//! lanes and runs the registered handler.
//!
//! ```text
//!  dispatch ──► pending ──claim──► active ──ok──────► (deleted)
//!                  ▲                 │
//!                  └──── retry ◄─────┤ transient, retries left
//!                                    └─────────────► dead
//!                                      terminal, or out of retries
//! ```
//!
//! The processor renews the lease of a task while its handler runs, so only
//! a lease left behind by a crashed worker expires. An expired lease puts
//! an active task back into pending on the next claim. [`InMemoryTaskQueue`] serves tests and local runs;
//! `RedisTaskQueue` (feature `redis`) is the shared, durable backend.

pub mod distributor;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod store;
pub mod types;
pub mod verify_email;

pub use distributor::{DispatchError, TaskDistributor};
pub use processor::{ProcessorConfig, ProcessorHandle, ProcessorStats, TaskOutcome, TaskProcessor};
#[cfg(feature = "redis")]
pub use redis_queue::RedisTaskQueue;
pub use store::{InMemoryTaskQueue, QueueError, QueueStats, TaskQueue};
pub use types::{
    BackoffStrategy, ClaimedTask, LeaseToken, RetryBackoff, Task, TaskError, TaskId, TaskInfo,
    TaskOptions, TaskState, DEFAULT_MAX_RETRY, QUEUE_CRITICAL, QUEUE_DEFAULT,
};
pub use verify_email::{SendVerifyEmailPayload, VerifyEmailHandler, TASK_SEND_VERIFY_EMAIL};
