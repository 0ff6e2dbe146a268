use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};

use crate::config::{BatchConfig, SchedulerConfig};
use crate::error::{Result, SchedulerError, TaskError};
use crate::events::{
    BatchCompletedEvent, BatchStartedEvent, SchedulerCallbacks, TaskCompletedEvent,
    TaskFailedEvent,
};
use crate::progress::ProgressTracker;
use crate::registry::{older_than, TrackerRegistry};
use crate::store::{BatchRecord, BatchStore};
use crate::types::{
    BatchResult, BatchStatus, BatchStatusView, ProgressSnapshot, QualityMetrics, Task,
    TaskOutcome, TaskStatus,
};
use crate::TaskExecutor;

/// Scheduler-side state of one batch. Guarded by the scheduler's batch lock,
/// which is never held across an await point.
struct BatchEntry {
    status: BatchStatus,
    config: BatchConfig,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    task_ids: Vec<String>,
    tracker: Arc<ProgressTracker>,
    /// Set by an explicit cancel; forces the final status.
    cancelled: bool,
    /// No new attempts may start once set (cancel or stop-on-first-error).
    halted: Arc<AtomicBool>,
    limit: Arc<Semaphore>,
    finalizing: bool,
    result: Option<BatchResult>,
    finished: watch::Sender<bool>,
}

impl BatchEntry {
    fn record(&self, batch_id: &str) -> BatchRecord {
        BatchRecord {
            batch_id: batch_id.to_string(),
            status: self.status,
            config: self.config.clone(),
            total_tasks: self.task_ids.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.result.as_ref().map(|r| r.completed_at),
            result: self.result.clone(),
        }
    }
}

/// What a worker needs to run the tasks of one batch.
#[derive(Clone)]
struct BatchHandle {
    batch_id: String,
    config: BatchConfig,
    tracker: Arc<ProgressTracker>,
    halted: Arc<AtomicBool>,
    limit: Arc<Semaphore>,
}

enum AttemptOutcome {
    Retry,
    Done,
}

struct Inner<E> {
    config: SchedulerConfig,
    executor: E,
    pool: Arc<Semaphore>,
    batches: Mutex<HashMap<String, BatchEntry>>,
    registry: TrackerRegistry,
    callbacks: SchedulerCallbacks,
    store: Option<Arc<dyn BatchStore>>,
    shutting_down: AtomicBool,
}

/// Runs batches of tasks on a bounded worker pool and tracks their progress.
///
/// Cloning is cheap; clones share the same pool, batches and callbacks.
///
/// # Example
///
/// ```ignore
/// let scheduler = BatchScheduler::new(SchedulerConfig::default(), MyExecutor)?;
/// let batch_id = scheduler.submit(tasks, None)?;
/// scheduler.start(&batch_id);
/// let result = scheduler.wait(&batch_id).await;
/// ```
pub struct BatchScheduler<E: TaskExecutor> {
    inner: Arc<Inner<E>>,
}

impl<E: TaskExecutor> Clone for BatchScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TaskExecutor> BatchScheduler<E> {
    /// Create a scheduler. Opens the SQLite mirror when `config.db_path` is
    /// set.
    pub fn new(config: SchedulerConfig, executor: E) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "sqlite")]
        let store: Option<Arc<dyn BatchStore>> = match config.db_path.as_deref() {
            Some(path) => Some(Arc::new(crate::store::SqliteBatchStore::open(Some(path))?)),
            None => None,
        };
        #[cfg(not(feature = "sqlite"))]
        let store: Option<Arc<dyn BatchStore>> = {
            if config.db_path.is_some() {
                tracing::warn!("db_path set but the sqlite feature is disabled; not mirroring");
            }
            None
        };

        tracing::info!(pool_size = config.pool_size, "batch scheduler created");

        Ok(Self {
            inner: Arc::new(Inner {
                pool: Arc::new(Semaphore::new(config.pool_size)),
                registry: TrackerRegistry::with_capacity(
                    config.history_capacity,
                    config.duration_window,
                ),
                config,
                executor,
                batches: Mutex::new(HashMap::new()),
                callbacks: SchedulerCallbacks::default(),
                store,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Mirror batch and task state into `store`, replacing any configured one.
    ///
    /// Must be called before the scheduler is cloned or used.
    pub fn with_store(mut self, store: Arc<dyn BatchStore>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.store = Some(store),
            None => tracing::error!("with_store called on a shared scheduler; store ignored"),
        }
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The registry holding every batch's progress tracker.
    pub fn trackers(&self) -> &TrackerRegistry {
        &self.inner.registry
    }

    // -- callbacks --

    pub fn on_batch_start<F>(&self, callback: F)
    where
        F: Fn(&BatchStartedEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.batch_start.register(callback);
    }

    pub fn on_batch_complete<F>(&self, callback: F)
    where
        F: Fn(&BatchCompletedEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.batch_complete.register(callback);
    }

    pub fn on_task_complete<F>(&self, callback: F)
    where
        F: Fn(&TaskCompletedEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.task_complete.register(callback);
    }

    pub fn on_task_failed<F>(&self, callback: F)
    where
        F: Fn(&TaskFailedEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.task_failed.register(callback);
    }

    // -- lifecycle --

    /// Register a batch under the default batch policy. Returns its id.
    pub fn submit(&self, tasks: Vec<Task>, batch_id: Option<String>) -> Result<String> {
        let config = self.inner.config.default_batch.clone();
        self.submit_with_config(tasks, batch_id, config)
    }

    /// Register a batch with its own policy. The batch stays `Created` until
    /// [`start`](Self::start) is called.
    pub fn submit_with_config(
        &self,
        tasks: Vec<Task>,
        batch_id: Option<String>,
        config: BatchConfig,
    ) -> Result<String> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        if tasks.is_empty() {
            return Err(SchedulerError::EmptyBatch);
        }
        config.validate()?;

        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(SchedulerError::InvalidTask(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
            if task.status != TaskStatus::Pending {
                return Err(SchedulerError::InvalidTask(format!(
                    "task {} is {}, expected pending",
                    task.id,
                    task.status.as_str()
                )));
            }
        }

        let batch_id = batch_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|t| t.with_max_retries(config.max_retries))
            .collect();

        let record = {
            let mut batches = self.inner.lock_batches();
            if batches.contains_key(&batch_id) {
                return Err(SchedulerError::DuplicateBatch(batch_id));
            }
            let incoming: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
            for (owner, entry) in batches.iter() {
                if let Some(id) = entry.task_ids.iter().find(|id| incoming.contains(id.as_str())) {
                    return Err(SchedulerError::InvalidTask(format!(
                        "task {} already belongs to batch {}",
                        id, owner
                    )));
                }
            }

            let tracker = self.inner.registry.create(&batch_id, tasks.len());
            let task_ids = tasks.iter().map(|t| t.id.clone()).collect();
            for task in &tasks {
                tracker.add_task(task.clone());
            }

            let (finished, _) = watch::channel(false);
            let entry = BatchEntry {
                status: BatchStatus::Created,
                limit: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
                config,
                created_at: Utc::now(),
                started_at: None,
                task_ids,
                tracker,
                cancelled: false,
                halted: Arc::new(AtomicBool::new(false)),
                finalizing: false,
                result: None,
                finished,
            };
            let record = entry.record(&batch_id);
            batches.insert(batch_id.clone(), entry);
            record
        };

        self.inner.mirror("save_batch", |s| s.save_batch(&record));
        for task in &tasks {
            self.inner.mirror("save_task", |s| s.save_task(&batch_id, task));
        }

        tracing::info!(batch_id = %batch_id, total_tasks = tasks.len(), "batch submitted");
        Ok(batch_id)
    }

    /// Move a `Created` batch to `Running` and dispatch every task.
    ///
    /// Returns `false` if the batch is unknown, not `Created`, the scheduler
    /// is shutting down, or no tokio runtime is available.
    pub fn start(&self, batch_id: &str) -> bool {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(batch_id, "start refused: scheduler is shutting down");
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(batch_id, "start needs a tokio runtime: {}", e);
                return false;
            }
        };

        let (handle, task_ids, event) = {
            let mut batches = self.inner.lock_batches();
            let Some(entry) = batches.get_mut(batch_id) else {
                tracing::warn!(batch_id, "start refused: unknown batch");
                return false;
            };
            if entry.status != BatchStatus::Created {
                tracing::warn!(
                    batch_id,
                    status = entry.status.as_str(),
                    "start refused: batch is not in created state"
                );
                return false;
            }

            let now = Utc::now();
            entry.status = BatchStatus::Running;
            entry.started_at = Some(now);
            entry.tracker.mark_started();

            let handle = BatchHandle {
                batch_id: batch_id.to_string(),
                config: entry.config.clone(),
                tracker: Arc::clone(&entry.tracker),
                halted: Arc::clone(&entry.halted),
                limit: Arc::clone(&entry.limit),
            };
            let event = BatchStartedEvent {
                batch_id: batch_id.to_string(),
                total_tasks: entry.task_ids.len(),
                started_at: now,
            };
            (handle, entry.task_ids.clone(), event)
        };

        self.inner.mirror("update_batch_status", |s| {
            s.update_batch_status(batch_id, BatchStatus::Running)
        });
        tracing::info!(
            batch_id,
            total_tasks = task_ids.len(),
            max_concurrent = handle.config.max_concurrent_tasks,
            "batch started"
        );
        self.inner.callbacks.batch_start.emit(&event);

        for task_id in task_ids {
            let inner = Arc::clone(&self.inner);
            let handle = handle.clone();
            runtime.spawn(async move {
                inner.run_task(handle, task_id).await;
            });
        }
        true
    }

    /// Cancel a batch. Tasks that have not started are cancelled at once;
    /// attempts already executing run to completion. The batch status
    /// becomes `Cancelled` immediately and the result is produced once the
    /// last running attempt has reported.
    ///
    /// Returns `false` for an unknown or already terminal batch.
    pub fn cancel(&self, batch_id: &str) -> bool {
        let tracker = {
            let mut batches = self.inner.lock_batches();
            let Some(entry) = batches.get_mut(batch_id) else {
                return false;
            };
            if entry.status.is_terminal() {
                return false;
            }
            entry.cancelled = true;
            entry.status = BatchStatus::Cancelled;
            entry.halted.store(true, Ordering::SeqCst);
            Arc::clone(&entry.tracker)
        };

        let cancelled = tracker.cancel_unstarted();
        tracing::info!(
            batch_id,
            cancelled_tasks = cancelled.len(),
            in_flight = tracker.processing_tasks().len(),
            "batch cancelled"
        );

        self.inner.mirror("update_batch_status", |s| {
            s.update_batch_status(batch_id, BatchStatus::Cancelled)
        });
        for task_id in &cancelled {
            self.inner.mirror_task(batch_id, &tracker, task_id);
        }

        self.inner.maybe_finalize(batch_id);
        true
    }

    /// Status and progress of a batch. Live while it runs, rebuilt from its
    /// result once finalized, `None` if it was never submitted (or has been
    /// cleaned up).
    pub fn status(&self, batch_id: &str) -> Option<BatchStatusView> {
        let batches = self.inner.lock_batches();
        let entry = batches.get(batch_id)?;
        let progress = match &entry.result {
            Some(result) => result.to_snapshot(),
            None => entry.tracker.snapshot(),
        };
        Some(BatchStatusView {
            batch_id: batch_id.to_string(),
            status: entry.status,
            progress,
        })
    }

    /// Shorthand for the progress part of [`status`](Self::status).
    pub fn progress(&self, batch_id: &str) -> Option<ProgressSnapshot> {
        self.status(batch_id).map(|view| view.progress)
    }

    /// The final result, available once the batch has been finalized.
    pub fn result(&self, batch_id: &str) -> Option<BatchResult> {
        self.inner.lock_batches().get(batch_id)?.result.clone()
    }

    /// Wait until the batch is finalized and return its result.
    ///
    /// Returns `None` at once for an unknown batch. A batch that is never
    /// started or cancelled never finishes.
    pub async fn wait(&self, batch_id: &str) -> Option<BatchResult> {
        let mut finished = {
            let batches = self.inner.lock_batches();
            batches.get(batch_id)?.finished.subscribe()
        };
        // An error means the entry was dropped by cleanup.
        let _ = finished.wait_for(|done| *done).await;
        self.result(batch_id)
    }

    /// Every known batch with its status, oldest first.
    pub fn list_batches(&self) -> Vec<(String, BatchStatus)> {
        let batches = self.inner.lock_batches();
        let mut list: Vec<(DateTime<Utc>, String, BatchStatus)> = batches
            .iter()
            .map(|(id, entry)| (entry.created_at, id.clone(), entry.status))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        list.into_iter().map(|(_, id, status)| (id, status)).collect()
    }

    /// Current task records of a batch, in submission order.
    pub fn batch_tasks(&self, batch_id: &str) -> Option<Vec<Task>> {
        self.tracker(batch_id).map(|t| t.tasks())
    }

    pub fn tracker(&self, batch_id: &str) -> Option<Arc<ProgressTracker>> {
        self.inner
            .lock_batches()
            .get(batch_id)
            .map(|e| Arc::clone(&e.tracker))
    }

    /// Live snapshot of every batch that still has a tracker.
    pub fn all_progress(&self) -> HashMap<String, ProgressSnapshot> {
        self.inner.registry.all_snapshots()
    }

    /// Forget finalized batches that finished more than `max_age` ago,
    /// together with their trackers. Returns the removed ids.
    pub fn cleanup_completed(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();

        let removed: Vec<String> = {
            let mut batches = self.inner.lock_batches();
            let expired: Vec<String> = batches
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .result
                        .as_ref()
                        .is_some_and(|r| older_than(r.completed_at, now, max_age))
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                batches.remove(id);
            }
            expired
        };

        for id in &removed {
            self.inner.registry.remove(id);
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "cleaned up completed batches");
        }
        removed
    }

    /// Refuse new submissions and starts, then wait for every running batch
    /// to finish.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let waiting: Vec<(String, watch::Receiver<bool>)> = {
            let batches = self.inner.lock_batches();
            batches
                .iter()
                .filter(|(_, e)| e.started_at.is_some() && e.result.is_none())
                .map(|(id, e)| (id.clone(), e.finished.subscribe()))
                .collect()
        };

        tracing::info!(running = waiting.len(), "scheduler shutting down");
        for (batch_id, mut rx) in waiting {
            if rx.wait_for(|done| *done).await.is_err() {
                tracing::debug!(batch_id = %batch_id, "batch removed during shutdown");
            }
        }
        tracing::info!("scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

impl<E: TaskExecutor> Inner<E> {
    fn lock_batches(&self) -> MutexGuard<'_, HashMap<String, BatchEntry>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mirror<F>(&self, op: &'static str, f: F)
    where
        F: FnOnce(&dyn BatchStore) -> anyhow::Result<()>,
    {
        if let Some(store) = &self.store {
            if let Err(e) = f(store.as_ref()) {
                tracing::warn!(op, "storage mirror failed: {:#}", e);
            }
        }
    }

    fn mirror_task(&self, batch_id: &str, tracker: &ProgressTracker, task_id: &str) {
        if self.store.is_none() {
            return;
        }
        if let Some(task) = tracker.task(task_id) {
            self.mirror("save_task", |s| s.save_task(batch_id, &task));
        }
    }

    /// Drive one task through its attempts until it is terminal.
    async fn run_task(self: Arc<Self>, batch: BatchHandle, task_id: String) {
        loop {
            match Arc::clone(&self).attempt(&batch, &task_id).await {
                AttemptOutcome::Done => break,
                AttemptOutcome::Retry => {
                    tracing::debug!(
                        batch_id = %batch.batch_id,
                        task_id = %task_id,
                        delay_ms = batch.config.retry_delay.as_millis() as u64,
                        "retry scheduled"
                    );
                    tokio::time::sleep(batch.config.retry_delay).await;
                }
            }
        }
        self.maybe_finalize(&batch.batch_id);
    }

    /// One attempt: wait for a slot, claim the task, execute, record.
    /// Both permits are released before any retry backoff.
    async fn attempt(self: Arc<Self>, batch: &BatchHandle, task_id: &str) -> AttemptOutcome {
        let Ok(_batch_permit) = Arc::clone(&batch.limit).acquire_owned().await else {
            return AttemptOutcome::Done;
        };
        let Ok(_pool_permit) = Arc::clone(&self.pool).acquire_owned().await else {
            return AttemptOutcome::Done;
        };

        if batch.halted.load(Ordering::SeqCst) {
            if batch.tracker.cancel_if_unstarted(task_id) {
                self.mirror_task(&batch.batch_id, &batch.tracker, task_id);
            }
            return AttemptOutcome::Done;
        }

        let Some(task) = batch.tracker.claim(task_id) else {
            return AttemptOutcome::Done;
        };
        self.mirror_task(&batch.batch_id, &batch.tracker, task_id);

        let attempt = task.retry_count + 1;
        tracing::debug!(
            batch_id = %batch.batch_id,
            task_id,
            attempt,
            input = %task.input_path,
            "task dispatched"
        );

        let started = Instant::now();
        let result = self.execute_guarded(&batch.config, task).await;
        let measured = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                let Some(done) = batch.tracker.record_success(task_id, &outcome, measured) else {
                    return AttemptOutcome::Done;
                };
                self.mirror_task(&batch.batch_id, &batch.tracker, task_id);
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    task_id,
                    attempt,
                    processing_time = done.processing_time.unwrap_or(measured),
                    "task completed"
                );
                self.callbacks.task_complete.emit(&TaskCompletedEvent {
                    batch_id: batch.batch_id.clone(),
                    task: done,
                });
                AttemptOutcome::Done
            }
            Err(error) => {
                let allow_retry = batch.config.auto_retry && !batch.halted.load(Ordering::SeqCst);
                let Some((failed, will_retry)) =
                    batch.tracker.record_failure(task_id, &error, allow_retry)
                else {
                    return AttemptOutcome::Done;
                };
                self.mirror_task(&batch.batch_id, &batch.tracker, task_id);
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    task_id,
                    attempt,
                    will_retry,
                    "task failed: {}",
                    error.message
                );
                self.callbacks.task_failed.emit(&TaskFailedEvent {
                    batch_id: batch.batch_id.clone(),
                    task: failed,
                    error: error.message.clone(),
                    will_retry,
                });

                if will_retry {
                    return AttemptOutcome::Retry;
                }
                if batch.config.stop_on_first_error && !batch.halted.swap(true, Ordering::SeqCst) {
                    let cancelled = batch.tracker.cancel_unstarted();
                    tracing::warn!(
                        batch_id = %batch.batch_id,
                        task_id,
                        cancelled_tasks = cancelled.len(),
                        "stopping batch on first error"
                    );
                    for id in &cancelled {
                        self.mirror_task(&batch.batch_id, &batch.tracker, id);
                    }
                }
                AttemptOutcome::Done
            }
        }
    }

    /// Run the executor under the per-task timeout on its own tokio task so
    /// a panicking executor is reported as a task failure.
    async fn execute_guarded(
        self: &Arc<Self>,
        config: &BatchConfig,
        task: Task,
    ) -> std::result::Result<TaskOutcome, TaskError> {
        let timeout = config.timeout_per_task;
        let inner = Arc::clone(self);
        let joined = tokio::spawn(async move {
            tokio::time::timeout(timeout, inner.executor.execute(&task)).await
        })
        .await;

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(TaskError::new(format!(
                "task timed out after {}s",
                timeout.as_secs_f64()
            ))),
            Err(e) if e.is_panic() => Err(TaskError::new("executor panicked")),
            Err(e) => Err(TaskError::new(format!("executor aborted: {}", e))),
        }
    }

    /// Finalize the batch if every task is terminal and nobody else has.
    fn maybe_finalize(&self, batch_id: &str) {
        let (tracker, cancelled, started_at) = {
            let mut batches = self.lock_batches();
            let Some(entry) = batches.get_mut(batch_id) else {
                return;
            };
            if entry.finalizing || !entry.tracker.snapshot().is_reconciled() {
                return;
            }
            entry.finalizing = true;
            (
                Arc::clone(&entry.tracker),
                entry.cancelled,
                entry.started_at.unwrap_or(entry.created_at),
            )
        };

        let tasks = tracker.tasks();
        let result = match catch_unwind(AssertUnwindSafe(|| {
            aggregate_result(batch_id, &tasks, cancelled, started_at)
        })) {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(batch_id, "result aggregation panicked; recording batch as failed");
                let mut result =
                    BatchResult::new(batch_id, BatchStatus::Failed, started_at, Utc::now());
                result.total_tasks = tasks.len();
                result
            }
        };

        {
            let mut batches = self.lock_batches();
            let Some(entry) = batches.get_mut(batch_id) else {
                return;
            };
            if entry.result.is_some() {
                tracing::error!(batch_id, "batch finalized twice; keeping the first result");
                return;
            }
            entry.status = result.status;
            entry.result = Some(result.clone());
        }

        self.mirror("save_batch_result", |s| s.save_batch_result(&result));
        tracing::info!(
            batch_id,
            status = result.status.as_str(),
            completed = result.completed_tasks,
            failed = result.failed_tasks,
            cancelled = result.cancelled_tasks,
            duration_secs = result.duration_seconds(),
            "batch finalized"
        );
        self.callbacks
            .batch_complete
            .emit(&BatchCompletedEvent { result });

        if let Some(entry) = self.lock_batches().get(batch_id) {
            entry.finished.send_replace(true);
        }
    }
}

/// Build the final result from the terminal task records.
fn aggregate_result(
    batch_id: &str,
    tasks: &[Task],
    cancelled: bool,
    started_at: DateTime<Utc>,
) -> BatchResult {
    let mut result = BatchResult::new(batch_id, BatchStatus::Running, started_at, Utc::now());
    result.total_tasks = tasks.len();

    let mut durations = Vec::new();
    let mut metric_sums: HashMap<String, (f64, usize)> = HashMap::new();

    for task in tasks {
        match task.status {
            TaskStatus::Completed => {
                result.completed_tasks += 1;
                if let Some(secs) = task.processing_time {
                    durations.push(secs);
                }
                result.total_output_size += task.output_size.unwrap_or(0);
                for (name, value) in task.quality_metrics.iter().flatten() {
                    let slot = metric_sums.entry(name.clone()).or_insert((0.0, 0));
                    slot.0 += value;
                    slot.1 += 1;
                }
            }
            TaskStatus::Failed => {
                result.failed_tasks += 1;
                result.add_failed_task(task);
            }
            TaskStatus::Cancelled => result.cancelled_tasks += 1,
            other => {
                tracing::error!(
                    batch_id,
                    task_id = %task.id,
                    status = other.as_str(),
                    "non-terminal task at finalization"
                );
            }
        }
    }

    if !durations.is_empty() {
        result.total_processing_time = durations.iter().sum();
        result.average_task_time = result.total_processing_time / durations.len() as f64;
    }
    result.quality_metrics = metric_sums
        .into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect::<QualityMetrics>();

    result.status = if cancelled {
        BatchStatus::Cancelled
    } else if result.failed_tasks == 0 || result.completed_tasks > 0 {
        BatchStatus::Completed
    } else {
        BatchStatus::Failed
    };
    result.compute_rates();
    result
}
