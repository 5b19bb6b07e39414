//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lane for latency-sensitive tasks (e.g. verification emails).
pub const QUEUE_CRITICAL: &str = "critical";

/// Lane used when no queue is specified.
pub const QUEUE_DEFAULT: &str = "default";

/// Retries allowed when no `max_retry` option is given.
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Unique task identifier (time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a task is in its lifecycle.
///
/// Succeeded tasks are deleted, so there is no terminal success state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for `not_before` (first run or scheduled retry).
    Pending,
    /// Leased by a worker.
    Active,
    /// Out of retries or failed terminally. Kept for inspection.
    Dead,
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Routes the task to a handler (e.g. `task:send_verify_email`).
    pub task_type: String,
    /// Opaque to the queue; handlers decode it.
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    /// Failed attempts so far that were followed by a retry.
    pub retried: u32,
    /// Not eligible for processing before this instant.
    pub not_before: DateTime<Utc>,
    pub state: TaskState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub died_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>, options: &TaskOptions) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            queue: options.queue.clone(),
            max_retry: options.max_retry,
            retried: 0,
            not_before: now + to_chrono(options.process_in),
            state: TaskState::Pending,
            last_error: None,
            created_at: now,
            died_at: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.not_before <= now
    }

    /// Whether a transient failure of the current attempt may be retried.
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }

    /// Back to pending after a failed attempt.
    pub fn mark_retry(&mut self, error: impl Into<String>, process_at: DateTime<Utc>) {
        self.retried += 1;
        self.last_error = Some(error.into());
        self.not_before = process_at;
        self.state = TaskState::Pending;
    }

    pub fn mark_dead(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.state = TaskState::Dead;
        self.died_at = Some(at);
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            task_type: self.task_type.clone(),
            queue: self.queue.clone(),
            max_retry: self.max_retry,
            not_before: self.not_before,
        }
    }
}

/// Enqueue options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_retry: u32,
    pub process_in: Duration,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            process_in: Duration::ZERO,
            queue: QUEUE_DEFAULT.to_string(),
        }
    }
}

impl TaskOptions {
    /// At most `n` retries after the first failed attempt.
    pub fn max_retry(mut self, n: u32) -> Self {
        self.max_retry = n;
        self
    }

    /// Not eligible before now + `delay`.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = name.into();
        self
    }
}

/// What the caller learns about an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub max_retry: u32,
    pub not_before: DateTime<Utc>,
}

/// Proof of an active claim. Queue mutations for a leased task must present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task leased to one worker until `lease_expires_at`.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub lease: LeaseToken,
    pub lease_expires_at: DateTime<Utc>,
}

/// Handler failure classification.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Retried with backoff while retries remain.
    #[error("{0:#}")]
    Transient(anyhow::Error),

    /// Never retried; the task goes straight to dead.
    #[error("skip retry: {0:#}")]
    Terminal(anyhow::Error),
}

impl TaskError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        Self::Terminal(err.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskError::Terminal(_))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry-1)
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Delay before the n-th retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the delay varies by up to ± this fraction.
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryBackoff {
    /// Retry immediately (tests, local tooling).
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given retry number (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(retry.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Longest delay a schedule honours. Larger ones are clamped so that
/// deadlines stay representable.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.min(MAX_DELAY).as_millis() as i64)
}
