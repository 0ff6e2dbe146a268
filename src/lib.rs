//! # Batch Scheduler
//!
//! Bounded-concurrency batch task scheduler with live progress tracking.
//!
//! ## Key Features
//!
//! - **Bounded worker pool**: one pool per scheduler, plus a per-batch
//!   concurrency limit
//! - **Retry policy**: failed tasks are re-dispatched after a delay while
//!   their retry budget lasts, without holding a pool slot
//! - **Per-task timeout**: an attempt that runs too long counts as a failure
//! - **Live progress**: counts, percentage, success rate, throughput and ETA,
//!   pushed to subscribers after every transition
//! - **Reconciled results**: every batch ends with exactly one
//!   [`BatchResult`] whose counts add up to the batch size
//! - **Optional SQLite mirror** of batch and task state
//!
//! ## Quick Start
//!
//! 1. Implement [`TaskExecutor`] for your file transformation
//! 2. Create a [`BatchScheduler`] with a [`SchedulerConfig`]
//! 3. [`submit`](BatchScheduler::submit) tasks, then
//!    [`start`](BatchScheduler::start) the batch
//! 4. Poll [`status`](BatchScheduler::status), subscribe to callbacks, or
//!    [`wait`](BatchScheduler::wait) for the result
//!
//! See the `demos/` directory for complete programs.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use config::{BatchConfig, BatchConfigBuilder, SchedulerConfig, SchedulerConfigBuilder};
pub use error::{SchedulerError, TaskError};
pub use events::{
    BatchCompletedEvent, BatchStartedEvent, ProgressEvent, ProgressEventKind, TaskCompletedEvent,
    TaskFailedEvent,
};
pub use logging::{init_logging, LoggingConfig, LoggingError, LoggingFormat};
pub use progress::{HistoryEntry, PerformanceMetrics, ProgressTracker, TaskStatistics};
pub use registry::TrackerRegistry;
pub use scheduler::BatchScheduler;
#[cfg(feature = "sqlite")]
pub use store::SqliteBatchStore;
pub use store::{BatchRecord, BatchStore};
pub use types::{
    BatchResult, BatchStatus, BatchStatusView, FailedTaskDetail, ProgressSnapshot,
    QualityMetrics, Task, TaskOutcome, TaskParams, TaskPriority, TaskStatus,
};

/// The transformation a scheduler runs for each task.
///
/// The scheduler never looks inside a task's parameters; it only hands the
/// task to the executor and records what comes back. An executor may be
/// called concurrently for different tasks, but never twice at once for
/// the same task.
///
/// # Example
///
/// ```ignore
/// use batch_scheduler::*;
///
/// struct Transcoder;
///
/// impl TaskExecutor for Transcoder {
///     async fn execute(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
///         let bytes = tokio::fs::read(&task.input_path).await?;
///         tokio::fs::write(&task.output_path, &bytes).await?;
///         Ok(TaskOutcome::success().with_output_size(bytes.len() as u64))
///     }
/// }
/// ```
pub trait TaskExecutor: Send + Sync + 'static {
    /// Run one attempt of `task`.
    ///
    /// Return `Err` to record a failure; the scheduler decides whether to
    /// retry. Dropping the returned future (on timeout) must be safe.
    fn execute(
        &self,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<TaskOutcome, TaskError>> + Send;
}

/// Build pending tasks from `(input, output)` pairs.
///
/// # Example
///
/// ```
/// use batch_scheduler::*;
///
/// let tasks = build_tasks(vec![
///     ("in/a.wav", "out/a.flac"),
///     ("in/b.wav", "out/b.flac"),
/// ])
/// .unwrap();
///
/// assert_eq!(tasks.len(), 2);
/// assert_eq!(tasks[0].status, TaskStatus::Pending);
/// assert!(build_tasks(vec![("", "out/c.flac")]).is_err());
/// ```
pub fn build_tasks<I, A, B>(pairs: I) -> Result<Vec<Task>, SchedulerError>
where
    I: IntoIterator<Item = (A, B)>,
    A: Into<String>,
    B: Into<String>,
{
    pairs
        .into_iter()
        .map(|(input, output)| Task::new(input, output))
        .collect()
}
