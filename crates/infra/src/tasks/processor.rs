//! Task processor with lanes, retry and dead-lettering.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::store::{QueueError, TaskQueue};
use super::types::{
    to_chrono, ClaimedTask, RetryBackoff, Task, TaskError, QUEUE_CRITICAL, QUEUE_DEFAULT,
};

type Handler = Arc<dyn Fn(Task) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging
    pub name: String,
    /// Number of worker loops
    pub concurrency: usize,
    /// Lanes and their weights. A lane with weight 10 is tried first twice
    /// as often as one with weight 5; lower-weight lanes are never starved.
    pub queues: Vec<(String, u32)>,
    /// Idle sleep when every lane is empty
    pub poll_interval: Duration,
    /// How long a claim stays exclusive without renewal. A running handler
    /// renews it every third of this period.
    pub lease: Duration,
    /// Upper bound on one handler run
    pub task_timeout: Duration,
    pub backoff: RetryBackoff,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            concurrency: 4,
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 10),
                (QUEUE_DEFAULT.to_string(), 5),
            ],
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(60),
            task_timeout: Duration::from_secs(30),
            backoff: RetryBackoff::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue(mut self, name: impl Into<String>, weight: u32) -> Self {
        let name = name.into();
        match self.queues.iter_mut().find(|(q, _)| *q == name) {
            Some(lane) => lane.1 = weight,
            None => self.queues.push((name, weight)),
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retried { retry: u32, process_at: DateTime<Utc> },
    Dead,
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub current_running: usize,
}

/// Handle to control a running processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl ProcessorHandle {
    /// Stops claiming, waits for in-flight handlers, returns final stats.
    pub async fn shutdown(self) -> ProcessorStats {
        let _ = self.shutdown.send(true);
        let stats = Arc::clone(&self.stats);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "task worker panicked");
            }
        }
        stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Consumer side of the task queue.
///
/// Claims tasks from weighted lanes, runs the handler registered for the
/// task type and records the outcome: completed tasks are removed, failed
/// ones are rescheduled with backoff until `max_retry` is used up and then
/// moved to the dead set.
pub struct TaskProcessor {
    queue: Arc<dyn TaskQueue>,
    handlers: HashMap<String, Handler>,
}

impl TaskProcessor {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task type.
    pub fn register_handler<F, Fut>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |task| handler(task).boxed());
        self.handlers.insert(task_type.into(), handler);
    }

    /// Spawns `config.concurrency` worker loops on the current runtime.
    pub fn spawn(self, config: ProcessorConfig) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ProcessorStats::default()));
        let processor = Arc::new(self);
        let config = Arc::new(config);

        let workers = (0..config.concurrency.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    Arc::clone(&processor),
                    Arc::clone(&config),
                    worker,
                    shutdown_rx.clone(),
                    Arc::clone(&stats),
                ))
            })
            .collect();

        ProcessorHandle {
            shutdown: shutdown_tx,
            workers,
            stats,
        }
    }

    /// Claims and processes at most one task, trying lanes in weighted
    /// random order. Returns `None` when every lane is empty.
    pub async fn process_next<R: Rng>(
        &self,
        config: &ProcessorConfig,
        rng: &mut R,
    ) -> Result<Option<TaskOutcome>, QueueError> {
        match self.claim_next(config, rng).await? {
            Some(claimed) => self.process(config, claimed).await.map(Some),
            None => Ok(None),
        }
    }

    /// Leases the next ready task, trying lanes in weighted random order.
    pub async fn claim_next<R: Rng>(
        &self,
        config: &ProcessorConfig,
        rng: &mut R,
    ) -> Result<Option<ClaimedTask>, QueueError> {
        for queue in lane_order(&config.queues, rng) {
            if let Some(claimed) = self.queue.claim(queue, config.lease).await? {
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    /// Runs the handler for a claimed task and settles it in the queue.
    pub async fn process(
        &self,
        config: &ProcessorConfig,
        claimed: ClaimedTask,
    ) -> Result<TaskOutcome, QueueError> {
        let task = &claimed.task;
        debug!(
            processor = %config.name,
            task_id = %task.id,
            task_type = %task.task_type,
            queue = %task.queue,
            retried = task.retried,
            "claimed task"
        );

        let result = match self.handlers.get(&task.task_type) {
            Some(handler) => {
                let run = tokio::time::timeout(config.task_timeout, handler(task.clone()));
                match self.renewing_lease(config, &claimed, run).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::transient(anyhow!(
                        "task timed out after {:?}",
                        config.task_timeout
                    ))),
                }
            }
            None => Err(TaskError::transient(anyhow!(
                "no handler registered for task type {}",
                task.task_type
            ))),
        };

        let err = match result {
            Ok(()) => {
                self.queue.complete(&claimed).await?;
                debug!(task_id = %task.id, "task completed");
                return Ok(TaskOutcome::Completed);
            }
            Err(err) => err,
        };

        let message = err.to_string();
        if err.is_terminal() || !task.can_retry() {
            self.queue.kill(&claimed, &message).await?;
            error!(
                processor = %config.name,
                task_id = %task.id,
                task_type = %task.task_type,
                queue = %task.queue,
                payload = %String::from_utf8_lossy(&task.payload),
                retried = task.retried,
                error = %message,
                "task moved to dead"
            );
            return Ok(TaskOutcome::Dead);
        }

        let retry = task.retried + 1;
        let process_at = Utc::now() + to_chrono(config.backoff.delay_for_retry(retry));
        self.queue.retry(&claimed, &message, process_at).await?;
        warn!(
            processor = %config.name,
            task_id = %task.id,
            task_type = %task.task_type,
            retry,
            max_retry = task.max_retry,
            %process_at,
            error = %message,
            "task failed, retry scheduled"
        );
        Ok(TaskOutcome::Retried { retry, process_at })
    }

    /// Drives `work` to completion while extending the lease of `claimed`.
    /// A renewal that fails stops further renewals; the settle step then
    /// reports the lost lease.
    async fn renewing_lease<F: Future>(
        &self,
        config: &ProcessorConfig,
        claimed: &ClaimedTask,
        work: F,
    ) -> F::Output {
        let mut work = std::pin::pin!(work);
        let period = (config.lease / 3).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewing = true;

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick(), if renewing => {
                    if let Err(e) = self.queue.extend(claimed, config.lease).await {
                        warn!(
                            processor = %config.name,
                            task_id = %claimed.task.id,
                            error = %e,
                            "failed to extend task lease"
                        );
                        renewing = false;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("TaskProcessor")
            .field("handlers", &types)
            .finish_non_exhaustive()
    }
}

/// Weighted random order over lanes, without replacement.
fn lane_order<'a, R: Rng>(queues: &'a [(String, u32)], rng: &mut R) -> Vec<&'a str> {
    let mut remaining: Vec<&'a (String, u32)> = queues.iter().filter(|(_, w)| *w > 0).collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
        let mut pick = rng.gen_range(0..total);
        let idx = remaining
            .iter()
            .position(|(_, w)| {
                let w = u64::from(*w);
                if pick < w {
                    true
                } else {
                    pick -= w;
                    false
                }
            })
            .unwrap_or(0);
        let (name, _) = remaining.remove(idx);
        order.push(name.as_str());
    }

    order
}

/// Books one finished run. `None` means the task could not be settled.
fn record(stats: &Mutex<ProcessorStats>, outcome: Option<&TaskOutcome>) {
    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
    s.current_running = s.current_running.saturating_sub(1);
    let Some(outcome) = outcome else {
        return;
    };
    s.processed += 1;
    match outcome {
        TaskOutcome::Completed => s.succeeded += 1,
        TaskOutcome::Retried { .. } => s.retried += 1,
        TaskOutcome::Dead => s.dead += 1,
    }
}

async fn worker_loop(
    processor: Arc<TaskProcessor>,
    config: Arc<ProcessorConfig>,
    worker: usize,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ProcessorStats>>,
) {
    info!(processor = %config.name, worker, "task worker started");
    let started = Instant::now();
    let mut rng = StdRng::from_entropy();

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        let idle = match processor.claim_next(&config, &mut rng).await {
            Ok(Some(claimed)) => {
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .current_running += 1;
                let result = processor.process(&config, claimed).await;
                record(&stats, result.as_ref().ok());
                if let Err(e) = result {
                    error!(processor = %config.name, worker, error = %e, "failed to settle task");
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(processor = %config.name, worker, error = %e, "failed to claim task");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                changed = shutdown.changed() => {
                    // A dropped handle also stops the worker.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(
        processor = %config.name,
        worker,
        uptime_secs = started.elapsed().as_secs(),
        "task worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::InMemoryTaskQueue;
    use crate::tasks::types::{TaskOptions, TaskState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_name("test-processor")
            .with_backoff(RetryBackoff::none())
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn enqueue(queue: &InMemoryTaskQueue, options: TaskOptions) -> Task {
        let task = Task::new("task:test", b"{}".to_vec(), &options);
        queue.enqueue(task.clone()).await.unwrap();
        task
    }

    async fn drain(processor: &TaskProcessor, config: &ProcessorConfig) -> Vec<TaskOutcome> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut outcomes = Vec::new();
        for _ in 0..50 {
            match processor.process_next(config, &mut rng).await.unwrap() {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }

    #[tokio::test]
    async fn always_failing_task_runs_max_retry_plus_one_times() {
        let queue = InMemoryTaskQueue::arc();
        let attempts = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(queue.clone());
        let counter = attempts.clone();
        processor.register_handler("task:test", move |_task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::transient(anyhow!("smtp unavailable")))
            }
        });

        let task = enqueue(&queue, TaskOptions::default().max_retry(3)).await;
        let outcomes = drain(&processor, &test_config()).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes.last(), Some(&TaskOutcome::Dead));

        let dead = queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(dead.state, TaskState::Dead);
        assert_eq!(dead.retried, 3);
        assert_eq!(dead.last_error.as_deref(), Some("smtp unavailable"));
    }

    #[tokio::test]
    async fn terminal_error_goes_dead_after_one_attempt() {
        let queue = InMemoryTaskQueue::arc();
        let attempts = Arc::new(AtomicU32::new(0));
        let mut processor = TaskProcessor::new(queue.clone());
        let counter = attempts.clone();
        processor.register_handler("task:test", move |_task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::terminal(anyhow!("malformed payload")))
            }
        });

        let task = enqueue(&queue, TaskOptions::default()).await;
        let outcomes = drain(&processor, &test_config()).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes, vec![TaskOutcome::Dead]);
        let dead = queue.dead_tasks(QUEUE_DEFAULT, 10).await.unwrap();
        assert_eq!(dead[0].id, task.id);
        assert_eq!(
            dead[0].last_error.as_deref(),
            Some("skip retry: malformed payload")
        );
    }

    #[tokio::test]
    async fn success_removes_the_task() {
        let queue = InMemoryTaskQueue::arc();
        let mut processor = TaskProcessor::new(queue.clone());
        processor.register_handler("task:test", |_task| async { Ok(()) });

        let task = enqueue(&queue, TaskOptions::default().queue(QUEUE_CRITICAL)).await;
        let outcomes = drain(&processor, &test_config()).await;

        assert_eq!(outcomes, vec![TaskOutcome::Completed]);
        assert!(queue.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn handler_timeout_is_retried() {
        let queue = InMemoryTaskQueue::arc();
        let mut processor = TaskProcessor::new(queue.clone());
        processor.register_handler("task:test", |_task| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });

        let task = enqueue(&queue, TaskOptions::default().max_retry(1)).await;
        let config = test_config().with_task_timeout(Duration::from_millis(20));
        let mut rng = StdRng::seed_from_u64(1);

        let outcome = processor.process_next(&config, &mut rng).await.unwrap();
        assert!(matches!(outcome, Some(TaskOutcome::Retried { retry: 1, .. })));
        let stored = queue.get(task.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_task_type_is_retried_not_dropped() {
        let queue = InMemoryTaskQueue::arc();
        let processor = TaskProcessor::new(queue.clone());
        let task = enqueue(&queue, TaskOptions::default()).await;
        let mut rng = StdRng::seed_from_u64(1);

        let outcome = processor
            .process_next(&test_config(), &mut rng)
            .await
            .unwrap();

        assert!(matches!(outcome, Some(TaskOutcome::Retried { .. })));
        assert_eq!(queue.get(task.id).await.unwrap().unwrap().retried, 1);
    }

    #[test]
    fn critical_lane_is_preferred_by_weight() {
        let config = ProcessorConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        let rounds = 3_000;

        let mut critical_first = 0;
        for _ in 0..rounds {
            let order = lane_order(&config.queues, &mut rng);
            assert_eq!(order.len(), 2);
            if order[0] == QUEUE_CRITICAL {
                critical_first += 1;
            }
        }

        // 10 / (10 + 5)
        let share = critical_first as f64 / rounds as f64;
        assert!((0.6..0.73).contains(&share), "critical share was {share}");
    }

    #[test]
    fn zero_weight_lanes_are_skipped() {
        let config = ProcessorConfig::default().with_queue(QUEUE_DEFAULT, 0);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(lane_order(&config.queues, &mut rng), vec![QUEUE_CRITICAL]);
    }

    #[tokio::test]
    async fn spawned_processor_handles_tasks_and_shuts_down() {
        let queue = InMemoryTaskQueue::arc();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut processor = TaskProcessor::new(queue.clone());
        processor.register_handler("task:test", move |task: Task| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(task.id);
                Ok(())
            }
        });

        let handle = processor.spawn(test_config().with_concurrency(2));
        let task = enqueue(&queue, TaskOptions::default()).await;

        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, task.id);

        let stats = handle.shutdown().await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.current_running, 0);
    }

    #[tokio::test]
    async fn slow_handler_keeps_its_lease_and_runs_once() {
        let queue = InMemoryTaskQueue::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut processor = TaskProcessor::new(queue.clone());
        let counter = runs.clone();
        processor.register_handler("task:test", move |_task| {
            let counter = counter.clone();
            let tx = tx.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = tx.send(());
                Ok(())
            }
        });

        let task = enqueue(&queue, TaskOptions::default()).await;
        let handle = processor.spawn(
            test_config()
                .with_concurrency(2)
                .with_lease(Duration::from_millis(150))
                .with_task_timeout(Duration::from_secs(30)),
        );

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let stats = handle.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.succeeded, 1);
        assert!(queue.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_handler_and_stops_claiming() {
        let queue = InMemoryTaskQueue::arc();
        let finished = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut processor = TaskProcessor::new(queue.clone());
        let done = finished.clone();
        processor.register_handler("task:test", move |task: Task| {
            let done = done.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.send(task.id);
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handle = processor.spawn(test_config().with_concurrency(1));
        let first = enqueue(&queue, TaskOptions::default()).await;
        let started = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started, first.id);

        // Queued while the only worker is busy.
        let second = enqueue(&queue, TaskOptions::default()).await;
        let stats = handle.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(stats.succeeded, 1);
        assert!(queue.get(first.id).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let left = queue.get(second.id).await.unwrap().unwrap();
        assert_eq!(left.state, TaskState::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn current_running_counts_handlers_not_polls() {
        let queue = InMemoryTaskQueue::arc();
        let release = Arc::new(tokio::sync::Notify::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut processor = TaskProcessor::new(queue.clone());
        let gate = release.clone();
        processor.register_handler("task:test", move |_task| {
            let gate = gate.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                gate.notified().await;
                Ok(())
            }
        });

        let handle = processor.spawn(test_config().with_concurrency(3));
        assert_eq!(handle.stats().current_running, 0);

        enqueue(&queue, TaskOptions::default()).await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Let the idle workers poll a few times.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().current_running, 1);

        release.notify_one();
        let stats = handle.shutdown().await;
        assert_eq!(stats.current_running, 0);
        assert_eq!(stats.succeeded, 1);
    }
}
