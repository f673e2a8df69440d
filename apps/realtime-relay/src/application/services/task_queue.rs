//! Background Task Queue
//!
//! Priority job queue persisted in the shared store, so every relay process
//! drains the same queue.
//!
//! # Storage Layout
//!
//! | Key                       | Type   | Contents                     |
//! |---------------------------|--------|------------------------------|
//! | `task:item:{id}`          | string | task JSON                    |
//! | `task:pending:{priority}` | list   | pending ids, FIFO            |
//! | `task:processing`         | zset   | claimed ids, scored by claim time (ms) |
//!
//! Claims go high → medium → low. The pop from a pending list and the insert
//! into `task:processing` happen in one upstream command, so an id is never
//! dropped between the two. A worker that dies mid-task, or a claim cut off
//! before the task was marked started, leaves its id in `task:processing`;
//! [`TaskQueue::recover_stalled`] requeues or fails it once it is older than
//! the processing timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::gate::{GateError, UpstreamGate};
use crate::application::ports::{UpstreamError, UpstreamStore};
use crate::domain::clock::{SharedClock, duration_millis, system_clock};
use crate::domain::task::{Task, TaskId, TaskPriority, TaskStatus};
use crate::infrastructure::metrics::{self, TaskOutcome};

const ITEM_PREFIX: &str = "task:item:";
const PENDING_PREFIX: &str = "task:pending:";
const PROCESSING_KEY: &str = "task:processing";

fn item_key(id: &str) -> String {
    format!("{ITEM_PREFIX}{id}")
}

fn pending_key(priority: TaskPriority) -> String {
    format!("{PENDING_PREFIX}{}", priority.as_str())
}

// =============================================================================
// Handler
// =============================================================================

/// Error returned by a task handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Executes tasks of one type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. An error counts as a failed attempt.
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

// =============================================================================
// Errors & Config
// =============================================================================

/// Task queue failure.
#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    /// A handler is already registered for the type.
    #[error("handler already registered for task type '{0}'")]
    DuplicateHandler(String),

    /// The shared store could not be used.
    #[error("task store unavailable: {0}")]
    Unavailable(#[from] GateError),

    /// A task could not be encoded.
    #[error("failed to encode task: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Tasks executed at the same time by [`TaskQueue::run`].
    pub concurrency: usize,
    /// Deadline for one handler invocation; also the stall threshold.
    pub processing_timeout: Duration,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            processing_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskQueueStats {
    /// Pending high-priority tasks.
    pub pending_high: usize,
    /// Pending medium-priority tasks.
    pub pending_medium: usize,
    /// Pending low-priority tasks.
    pub pending_low: usize,
    /// Tasks currently claimed.
    pub processing: usize,
}

impl TaskQueueStats {
    /// Pending tasks across all priorities.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending_high + self.pending_medium + self.pending_low
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Shared-store backed task queue.
pub struct TaskQueue {
    gate: UpstreamGate,
    clock: SharedClock,
    config: TaskQueueConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.config)
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Create a queue on the system clock.
    #[must_use]
    pub fn new(gate: UpstreamGate, config: TaskQueueConfig) -> Self {
        Self::with_clock(gate, config, system_clock())
    }

    /// Create a queue on a specific clock.
    #[must_use]
    pub fn with_clock(gate: UpstreamGate, config: TaskQueueConfig, clock: SharedClock) -> Self {
        Self {
            gate,
            clock,
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Queue configuration.
    #[must_use]
    pub const fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Register the handler for a task type.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::DuplicateHandler`] if the type already has one.
    pub fn register_handler(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), TaskQueueError> {
        let task_type = task_type.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&task_type) {
            tracing::error!(task_type = %task_type, "Duplicate task handler registration");
            return Err(TaskQueueError::DuplicateHandler(task_type));
        }
        tracing::debug!(task_type = %task_type, "Registered task handler");
        handlers.insert(task_type, handler);
        Ok(())
    }

    /// Persist a new pending task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be stored.
    pub async fn enqueue(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: TaskPriority,
        max_retries: u32,
    ) -> Result<TaskId, TaskQueueError> {
        let task = Task::new(task_type, payload, priority, max_retries, self.now());
        let body = serde_json::to_string(&task)?;
        let item = item_key(&task.id);
        let pending = pending_key(priority);
        let (item, pending, body, id) = (item.as_str(), pending.as_str(), body.as_str(), task.id.as_str());

        self.gate
            .run("task_enqueue", |upstream| async move {
                upstream.set(item, body, None).await?;
                upstream.list_push(pending, id).await
            })
            .await?;

        tracing::debug!(task_id = %task.id, task_type = %task.task_type, priority = priority.as_str(), "Enqueued task");
        Ok(task.id)
    }

    /// Claim the next pending task, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        let claimed_at = self.clock.now_millis();
        let now = self.now();
        let claimed = self
            .gate
            .run("task_claim", |upstream| async move {
                for priority in TaskPriority::CLAIM_ORDER {
                    let key = pending_key(priority);
                    while let Some(id) = upstream
                        .list_pop_to_sorted(&key, PROCESSING_KEY, claimed_at)
                        .await?
                    {
                        let task = load_task(upstream.as_ref(), &id).await?;
                        let Some(mut task) = task.filter(|t| t.status == TaskStatus::Pending)
                        else {
                            tracing::warn!(task_id = %id, "Skipping pending id without a pending task");
                            upstream.sorted_remove(PROCESSING_KEY, &id).await?;
                            continue;
                        };
                        task.start(now);
                        store_task(upstream.as_ref(), &task).await?;
                        return Ok(Some(task));
                    }
                }
                Ok::<_, UpstreamError>(None)
            })
            .await?;
        Ok(claimed)
    }

    /// Run a claimed task to its next status.
    ///
    /// # Errors
    ///
    /// Returns an error if the outcome cannot be stored.
    pub async fn execute(&self, mut task: Task) -> Result<TaskStatus, TaskQueueError> {
        let handler = self.handlers.read().get(&task.task_type).cloned();
        let outcome = match handler {
            Some(handler) => {
                match tokio::time::timeout(self.config.processing_timeout, handler.handle(&task))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(error.to_string()),
                    Err(_) => Err(format!(
                        "timed out after {:?}",
                        self.config.processing_timeout
                    )),
                }
            }
            None => Err(format!("no handler registered for '{}'", task.task_type)),
        };

        let now = self.now();
        let status = match outcome {
            Ok(()) => {
                task.complete(now);
                tracing::info!(task_id = %task.id, task_type = %task.task_type, "Task completed");
                metrics::record_task(&task.task_type, TaskOutcome::Completed);
                TaskStatus::Completed
            }
            Err(error) => {
                let status = task.fail(error.as_str(), now);
                let outcome = if status == TaskStatus::Pending {
                    TaskOutcome::Retried
                } else {
                    TaskOutcome::Failed
                };
                tracing::warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    retries = task.retries,
                    max_retries = task.max_retries,
                    error = %error,
                    "Task attempt failed"
                );
                metrics::record_task(&task.task_type, outcome);
                status
            }
        };

        self.settle(&task).await?;
        Ok(status)
    }

    /// Claim and execute one task.
    ///
    /// Returns `None` when nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn process_next(&self) -> Result<Option<TaskStatus>, TaskQueueError> {
        match self.claim_next().await? {
            Some(task) => self.execute(task).await.map(Some),
            None => Ok(None),
        }
    }

    /// Requeue or fail tasks stuck in processing past the processing timeout.
    ///
    /// A task still pending was claimed but never started; it goes back to
    /// its queue without spending a retry.
    ///
    /// Returns how many tasks were recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn recover_stalled(&self) -> Result<usize, TaskQueueError> {
        let now_ms = self.clock.now_millis();
        let cutoff = now_ms.saturating_sub(duration_millis(self.config.processing_timeout));
        let now = self.now();

        let recovered = self
            .gate
            .run("task_recover", |upstream| async move {
                let mut recovered = 0_usize;
                for id in upstream.sorted_members_upto(PROCESSING_KEY, cutoff).await? {
                    let Some(mut task) = load_task(upstream.as_ref(), &id).await? else {
                        upstream.sorted_remove(PROCESSING_KEY, &id).await?;
                        continue;
                    };

                    let status = match task.status {
                        TaskStatus::Processing => {
                            let status = task.fail("processing timed out", now);
                            store_task(upstream.as_ref(), &task).await?;
                            status
                        }
                        TaskStatus::Pending => TaskStatus::Pending,
                        TaskStatus::Completed | TaskStatus::Failed => {
                            upstream.sorted_remove(PROCESSING_KEY, &id).await?;
                            continue;
                        }
                    };
                    if status == TaskStatus::Pending {
                        upstream
                            .list_push(&pending_key(task.priority), &task.id)
                            .await?;
                    }
                    upstream.sorted_remove(PROCESSING_KEY, &task.id).await?;

                    tracing::warn!(task_id = %task.id, status = ?status, "Recovered stalled task");
                    metrics::record_task(&task.task_type, TaskOutcome::Recovered);
                    recovered += 1;
                }
                Ok::<_, UpstreamError>(recovered)
            })
            .await?;
        Ok(recovered)
    }

    /// Queue depths.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn stats(&self) -> Result<TaskQueueStats, TaskQueueError> {
        let stats = self
            .gate
            .run("task_stats", |upstream| async move {
                Ok::<_, UpstreamError>(TaskQueueStats {
                    pending_high: upstream.list_len(&pending_key(TaskPriority::High)).await?,
                    pending_medium: upstream
                        .list_len(&pending_key(TaskPriority::Medium))
                        .await?,
                    pending_low: upstream.list_len(&pending_key(TaskPriority::Low)).await?,
                    processing: upstream.sorted_len(PROCESSING_KEY).await?,
                })
            })
            .await?;
        Ok(stats)
    }

    /// Drain the queue with bounded concurrency until cancelled.
    ///
    /// In-flight tasks are awaited before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        tracing::info!(concurrency, "Task worker started");

        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Some(task)) => {
                    let queue = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(error) = queue.execute(task).await {
                            tracing::error!(error = %error, "Failed to store task outcome");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if sleep_or_cancel(&cancel, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(error) => {
                    drop(permit);
                    tracing::debug!(error = %error, "Task claim skipped");
                    if sleep_or_cancel(&cancel, self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        let total = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(total).await;
        tracing::info!("Task worker stopped");
    }

    fn now(&self) -> DateTime<Utc> {
        i64::try_from(self.clock.now_millis())
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }

    async fn settle(&self, task: &Task) -> Result<(), TaskQueueError> {
        let body = serde_json::to_string(task)?;
        let item = item_key(&task.id);
        let requeue = (task.status == TaskStatus::Pending).then(|| pending_key(task.priority));
        let (item, body, id, requeue) = (item.as_str(), body.as_str(), task.id.as_str(), requeue.as_deref());

        self.gate
            .run("task_settle", |upstream| async move {
                upstream.set(item, body, None).await?;
                if let Some(pending) = requeue {
                    upstream.list_push(pending, id).await?;
                }
                upstream.sorted_remove(PROCESSING_KEY, id).await
            })
            .await?;
        Ok(())
    }
}

/// Returns `true` if cancelled while sleeping.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

async fn load_task(upstream: &dyn UpstreamStore, id: &str) -> Result<Option<Task>, UpstreamError> {
    let Some(body) = upstream.get(&item_key(id)).await? else {
        return Ok(None);
    };
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| UpstreamError::InvalidData(format!("task {id}: {e}")))
}

async fn store_task(upstream: &dyn UpstreamStore, task: &Task) -> Result<(), UpstreamError> {
    let body =
        serde_json::to_string(task).map_err(|e| UpstreamError::InvalidData(e.to_string()))?;
    upstream.set(&item_key(&task.id), &body, None).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::infrastructure::memory::{MemoryConnector, MemoryStore};
    use crate::infrastructure::resilience::{
        CircuitBreaker, CircuitBreakerConfig, ConnectionConfig, ConnectionManager,
    };

    struct Fixture {
        queue: Arc<TaskQueue>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: TaskQueueConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let gate = UpstreamGate::new(
            Arc::new(CircuitBreaker::with_clock(
                "tasks",
                CircuitBreakerConfig::default(),
                clock.clone(),
            )),
            Arc::new(ConnectionManager::with_clock(
                Arc::new(MemoryConnector::new(store.clone())),
                ConnectionConfig::default(),
                clock.clone(),
            )),
            Duration::from_secs(1),
        );
        Fixture {
            queue: Arc::new(TaskQueue::with_clock(gate, config, clock.clone())),
            store,
            clock,
        }
    }

    fn ok_handler() -> Arc<MockTaskHandler> {
        let mut handler = MockTaskHandler::new();
        handler.expect_handle().returning(|_| Ok(()));
        Arc::new(handler)
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let f = fixture(TaskQueueConfig::default());
        f.queue.register_handler("refresh", ok_handler()).unwrap();

        let err = f.queue.register_handler("refresh", ok_handler()).unwrap_err();
        assert!(matches!(err, TaskQueueError::DuplicateHandler(t) if t == "refresh"));
    }

    #[tokio::test]
    async fn enqueue_persists_task_and_pending_id() {
        let f = fixture(TaskQueueConfig::default());
        let id = f
            .queue
            .enqueue("refresh", json!({"pair": "0xabc"}), TaskPriority::Medium, 2)
            .await
            .unwrap();

        let stored: Task = serde_json::from_str(&f.store.peek(&item_key(&id)).unwrap()).unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(f.queue.stats().await.unwrap().pending_medium, 1);
    }

    #[tokio::test]
    async fn claims_follow_priority_then_fifo() {
        let f = fixture(TaskQueueConfig::default());
        let low = f.queue.enqueue("t", json!(1), TaskPriority::Low, 0).await.unwrap();
        let med_a = f.queue.enqueue("t", json!(2), TaskPriority::Medium, 0).await.unwrap();
        let med_b = f.queue.enqueue("t", json!(3), TaskPriority::Medium, 0).await.unwrap();
        let high = f.queue.enqueue("t", json!(4), TaskPriority::High, 0).await.unwrap();

        let mut order = Vec::new();
        while let Some(task) = f.queue.claim_next().await.unwrap() {
            assert_eq!(task.status, TaskStatus::Processing);
            order.push(task.id);
        }
        assert_eq!(order, vec![high, med_a, med_b, low]);
        assert_eq!(f.queue.stats().await.unwrap().processing, 4);
    }

    #[tokio::test]
    async fn successful_task_completes() {
        let f = fixture(TaskQueueConfig::default());
        let mut handler = MockTaskHandler::new();
        handler
            .expect_handle()
            .withf(|task| task.payload == json!({"n": 1}))
            .times(1)
            .returning(|_| Ok(()));
        f.queue.register_handler("refresh", Arc::new(handler)).unwrap();

        let id = f.queue.enqueue("refresh", json!({"n": 1}), TaskPriority::High, 0).await.unwrap();
        assert_eq!(f.queue.process_next().await.unwrap(), Some(TaskStatus::Completed));

        let stored: Task = serde_json::from_str(&f.store.peek(&item_key(&id)).unwrap()).unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(f.queue.stats().await.unwrap(), TaskQueueStats::default());
    }

    #[tokio::test]
    async fn failing_task_retries_then_fails() {
        let f = fixture(TaskQueueConfig::default());
        let mut handler = MockTaskHandler::new();
        handler
            .expect_handle()
            .times(2)
            .returning(|_| Err("upstream rejected".into()));
        f.queue.register_handler("refresh", Arc::new(handler)).unwrap();

        let id = f.queue.enqueue("refresh", json!({}), TaskPriority::Low, 1).await.unwrap();

        assert_eq!(f.queue.process_next().await.unwrap(), Some(TaskStatus::Pending));
        assert_eq!(f.queue.stats().await.unwrap().pending_low, 1);

        assert_eq!(f.queue.process_next().await.unwrap(), Some(TaskStatus::Failed));
        assert_eq!(f.queue.process_next().await.unwrap(), None);

        let stored: Task = serde_json::from_str(&f.store.peek(&item_key(&id)).unwrap()).unwrap();
        assert_eq!(stored.retries, 2);
        assert_eq!(stored.last_error.as_deref(), Some("upstream rejected"));
    }

    #[tokio::test]
    async fn missing_handler_counts_as_failure() {
        let f = fixture(TaskQueueConfig::default());
        f.queue.enqueue("unknown", json!({}), TaskPriority::Medium, 0).await.unwrap();
        assert_eq!(f.queue.process_next().await.unwrap(), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn stalled_task_is_requeued() {
        let f = fixture(TaskQueueConfig {
            processing_timeout: Duration::from_secs(60),
            ..TaskQueueConfig::default()
        });
        f.queue.enqueue("t", json!({}), TaskPriority::High, 3).await.unwrap();
        let claimed = f.queue.claim_next().await.unwrap().unwrap();

        assert_eq!(f.queue.recover_stalled().await.unwrap(), 0);

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.queue.recover_stalled().await.unwrap(), 1);

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.pending_high, 1);

        let again = f.queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.retries, 1);
    }

    #[tokio::test]
    async fn interrupted_claim_is_recovered() {
        let f = fixture(TaskQueueConfig {
            processing_timeout: Duration::from_secs(60),
            ..TaskQueueConfig::default()
        });
        let id = f.queue.enqueue("t", json!({}), TaskPriority::High, 3).await.unwrap();

        // The connection drops right after the id leaves the pending list.
        f.store
            .fail_next("set", UpstreamError::Connection("reset by peer".into()));
        let err = f.queue.claim_next().await.unwrap_err();
        assert!(matches!(err, TaskQueueError::Unavailable(_)));

        f.clock.advance(Duration::from_secs(61));
        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.pending(), 0);
        assert_eq!(stats.processing, 1);

        assert_eq!(f.queue.recover_stalled().await.unwrap(), 1);
        let again = f.queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.retries, 0);
        assert_eq!(f.queue.stats().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn stale_duplicate_id_is_skipped() {
        let f = fixture(TaskQueueConfig::default());
        let id = f.queue.enqueue("t", json!({}), TaskPriority::Low, 0).await.unwrap();
        f.store.list_push(&pending_key(TaskPriority::Low), &id).await.unwrap();

        let first = f.queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.id, id);
        assert!(f.queue.claim_next().await.unwrap().is_none());
        assert_eq!(f.queue.stats().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn unavailable_store_surfaces_error() {
        let f = fixture(TaskQueueConfig::default());
        f.store.fail_with(Some(UpstreamError::Command("ERR".into())));
        let err = f
            .queue
            .enqueue("t", json!({}), TaskPriority::High, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskQueueError::Unavailable(_)));
    }

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_drains_queue_until_cancelled() {
        let f = fixture(TaskQueueConfig {
            poll_interval: Duration::from_millis(10),
            ..TaskQueueConfig::default()
        });
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        f.queue.register_handler("count", handler.clone()).unwrap();
        for n in 0..5 {
            f.queue.enqueue("count", json!(n), TaskPriority::Medium, 0).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(f.queue.clone().run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.0.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(f.queue.stats().await.unwrap(), TaskQueueStats::default());
    }
}
