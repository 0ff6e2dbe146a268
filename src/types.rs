use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, TaskError};

/// Opaque processing parameters, passed through to the executor untouched.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// Opaque quality metrics reported by the executor.
pub type QualityMetrics = HashMap<String, f64>;

/// Per-task status.
///
/// Lifecycle: Pending -> Processing -> Completed/Failed, with
/// Failed -> Retrying -> Processing while retries remain, and
/// any non-terminal state -> Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "retrying" => Some(TaskStatus::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the scheduler may hand a task in this state to the executor.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    /// Whether the lifecycle has an edge from `self` to `next`. The retry
    /// budget is checked separately.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending | TaskStatus::Retrying, TaskStatus::Processing) => true,
            (TaskStatus::Processing, TaskStatus::Completed | TaskStatus::Failed) => true,
            (TaskStatus::Failed, TaskStatus::Retrying) => true,
            (from, TaskStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Overall batch status.
///
/// `Paused` is reserved and never entered by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(BatchStatus::Created),
            "running" => Some(BatchStatus::Running),
            "paused" => Some(BatchStatus::Paused),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// Task priority. Informational only: dispatch order does not depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_i32(&self) -> i32 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Urgent => 4,
        }
    }

    pub fn from_i32(val: i32) -> Self {
        match val {
            4 => TaskPriority::Urgent,
            3 => TaskPriority::High,
            2 => TaskPriority::Normal,
            _ => TaskPriority::Low,
        }
    }
}

/// One file-to-file unit of work with its own lifecycle and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier, generated at creation.
    pub id: String,
    pub input_path: String,
    pub output_path: String,
    pub params: TaskParams,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only on failure.
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// Processing duration in seconds (set after a successful attempt).
    pub processing_time: Option<f64>,
    pub output_size: Option<u64>,
    pub quality_metrics: Option<QualityMetrics>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

impl Task {
    /// Create a pending task. Both references must be non-empty.
    pub fn new(
        input_path: impl Into<String>,
        output_path: impl Into<String>,
    ) -> Result<Self, SchedulerError> {
        let input_path = input_path.into();
        let output_path = output_path.into();
        if input_path.trim().is_empty() {
            return Err(SchedulerError::InvalidTask(
                "input path must not be empty".to_string(),
            ));
        }
        if output_path.trim().is_empty() {
            return Err(SchedulerError::InvalidTask(
                "output path must not be empty".to_string(),
            ));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            input_path,
            output_path,
            params: TaskParams::new(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            error_details: None,
            processing_time: None,
            output_size: None,
            quality_metrics: None,
        })
    }

    /// Set the processing parameters (builder pattern).
    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    /// Set a single processing parameter (builder pattern).
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retry_count = self.retry_count.min(max_retries);
        self
    }

    /// Wall-clock duration of the current attempt, if it has started.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A failed task may be retried while its budget lasts.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    pub(crate) fn start_processing(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Processing;
        self.started_at = Some(now.max(self.created_at));
        self.completed_at = None;
    }

    pub(crate) fn complete(&mut self, outcome: &TaskOutcome, measured_secs: f64) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(self.finish_time());
        self.processing_time = Some(outcome.processing_time.unwrap_or(measured_secs));
        self.output_size = outcome.output_size;
        self.quality_metrics = outcome.quality_metrics.clone();
        self.error_message = None;
        self.error_details = None;
    }

    pub(crate) fn fail(&mut self, error: &TaskError) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(self.finish_time());
        self.error_message = Some(error.message.clone());
        self.error_details = error.details.clone();
    }

    /// Move a failed task back to a runnable state. Returns `false` (and
    /// leaves the task untouched) when the retry budget is exhausted.
    pub(crate) fn retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        self.status = TaskStatus::Retrying;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        self.error_details = None;
        true
    }

    pub(crate) fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(self.finish_time());
    }

    fn finish_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.started_at {
            Some(started) => now.max(started),
            None => now.max(self.created_at),
        }
    }
}

/// Successful result of one executor call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    /// Processing time in seconds as reported by the executor. When `None`
    /// the scheduler records its own wall-clock measurement.
    pub processing_time: Option<f64>,
    pub output_size: Option<u64>,
    pub quality_metrics: Option<QualityMetrics>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_processing_time(mut self, secs: f64) -> Self {
        self.processing_time = Some(secs);
        self
    }

    pub fn with_output_size(mut self, bytes: u64) -> Self {
        self.output_size = Some(bytes);
        self
    }

    pub fn with_quality_metrics(mut self, metrics: QualityMetrics) -> Self {
        self.quality_metrics = Some(metrics);
        self
    }
}

/// Point-in-time aggregate view of one batch's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub batch_id: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// Tasks not yet terminal (pending, processing or retrying).
    pub pending_tasks: usize,
    pub progress_percentage: f64,
    /// Completed share of processed (completed + failed) tasks, in percent.
    pub success_rate: f64,
    pub elapsed_seconds: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Terminal tasks per second since the batch started.
    pub throughput: f64,
    /// Moving average over the recent-duration window, in seconds.
    pub average_processing_time: f64,
}

impl ProgressSnapshot {
    pub fn processed_tasks(&self) -> usize {
        self.completed_tasks + self.failed_tasks + self.cancelled_tasks
    }

    pub fn is_reconciled(&self) -> bool {
        self.processed_tasks() == self.total_tasks
    }
}

/// Status of a batch together with its progress, as returned by
/// [`BatchScheduler::status`](crate::BatchScheduler::status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusView {
    pub batch_id: String,
    pub status: BatchStatus,
    pub progress: ProgressSnapshot,
}

/// Detail record for a task that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTaskDetail {
    pub task_id: String,
    pub input_path: String,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub retry_count: u32,
}

pub const UNKNOWN_ERROR: &str = "unknown_error";

/// Final, immutable summary of a batch. Produced once, at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Mean processing time of completed tasks, in seconds.
    pub average_task_time: f64,
    /// Sum of the processing times of completed tasks, in seconds.
    #[serde(default)]
    pub total_processing_time: f64,
    /// Completed share of all tasks, in percent.
    pub success_rate: f64,
    /// Tasks per second over the batch's wall-clock duration.
    pub throughput: f64,
    pub total_output_size: u64,
    /// Per-metric mean across completed tasks that reported it.
    pub quality_metrics: QualityMetrics,
    /// Error message -> number of failed tasks.
    pub error_summary: HashMap<String, usize>,
    pub failed_task_details: Vec<FailedTaskDetail>,
}

impl BatchResult {
    /// Start an empty result; counts and aggregates are filled by the caller.
    pub(crate) fn new(
        batch_id: &str,
        status: BatchStatus,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            status,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            started_at,
            completed_at: completed_at.max(started_at),
            average_task_time: 0.0,
            total_processing_time: 0.0,
            success_rate: 0.0,
            throughput: 0.0,
            total_output_size: 0,
            quality_metrics: QualityMetrics::new(),
            error_summary: HashMap::new(),
            failed_task_details: Vec::new(),
        }
    }

    /// Record a failed task's detail and bump its error-type count.
    pub(crate) fn add_failed_task(&mut self, task: &Task) {
        self.failed_task_details.push(FailedTaskDetail {
            task_id: task.id.clone(),
            input_path: task.input_path.clone(),
            error_message: task.error_message.clone(),
            error_details: task.error_details.clone(),
            retry_count: task.retry_count,
        });

        let key = task
            .error_message
            .clone()
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
        *self.error_summary.entry(key).or_insert(0) += 1;
    }

    /// Derive success rate and throughput from the counts and timestamps.
    pub(crate) fn compute_rates(&mut self) {
        self.success_rate = if self.total_tasks > 0 {
            self.completed_tasks as f64 / self.total_tasks as f64 * 100.0
        } else {
            0.0
        };
        let secs = self.duration_seconds();
        self.throughput = if secs > 0.0 {
            self.total_tasks as f64 / secs
        } else {
            0.0
        };
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }

    /// Rebuild a progress view from the stored result.
    pub fn to_snapshot(&self) -> ProgressSnapshot {
        let processed = self.completed_tasks + self.failed_tasks + self.cancelled_tasks;
        let judged = self.completed_tasks + self.failed_tasks;
        ProgressSnapshot {
            batch_id: self.batch_id.clone(),
            total_tasks: self.total_tasks,
            completed_tasks: self.completed_tasks,
            failed_tasks: self.failed_tasks,
            cancelled_tasks: self.cancelled_tasks,
            pending_tasks: self.total_tasks.saturating_sub(processed),
            progress_percentage: if self.total_tasks > 0 {
                processed as f64 / self.total_tasks as f64 * 100.0
            } else {
                0.0
            },
            success_rate: if judged > 0 {
                self.completed_tasks as f64 / judged as f64 * 100.0
            } else {
                0.0
            },
            elapsed_seconds: self.duration_seconds(),
            estimated_completion: None,
            throughput: self.throughput,
            average_processing_time: self.average_task_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("in/a.wav", "out/a.wav").unwrap()
    }

    #[test]
    fn test_new_task_rejects_empty_paths() {
        assert!(matches!(
            Task::new("", "out.wav"),
            Err(SchedulerError::InvalidTask(_))
        ));
        assert!(matches!(
            Task::new("in.wav", "  "),
            Err(SchedulerError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_transition_graph() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Retrying.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        for from in [Pending, Processing, Retrying] {
            assert!(from.can_transition_to(Cancelled));
        }

        assert!(!Processing.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Processing));
        for from in [Completed, Failed, Cancelled] {
            assert!(!from.can_transition_to(Cancelled));
            assert!(!from.can_transition_to(Pending));
        }
        for to in [Pending, Processing, Completed, Failed, Cancelled, Retrying] {
            assert!(!Completed.can_transition_to(to));
            assert!(!Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn test_new_task_defaults() {
        let t = task();
        assert!(!t.id.is_empty());
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 0);
        assert_eq!(t.max_retries, DEFAULT_MAX_RETRIES);
        assert!(t.started_at.is_none());
        assert!(t.duration().is_none());
    }

    #[test]
    fn test_lifecycle_timestamps_are_ordered() {
        let mut t = task();
        t.start_processing();
        let started = t.started_at.unwrap();
        assert!(started >= t.created_at);

        t.complete(&TaskOutcome::success().with_output_size(42), 0.25);
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.completed_at.unwrap() >= started);
        assert_eq!(t.processing_time, Some(0.25));
        assert_eq!(t.output_size, Some(42));
    }

    #[test]
    fn test_reported_processing_time_wins() {
        let mut t = task();
        t.start_processing();
        t.complete(&TaskOutcome::success().with_processing_time(3.5), 0.1);
        assert_eq!(t.processing_time, Some(3.5));
    }

    #[test]
    fn test_retry_resets_attempt_fields() {
        let mut t = task().with_max_retries(1);
        t.start_processing();
        t.fail(&TaskError::new("boom").with_details(serde_json::json!({"x": 1})));
        assert!(t.can_retry());

        assert!(t.retry());
        assert_eq!(t.status, TaskStatus::Retrying);
        assert_eq!(t.retry_count, 1);
        assert!(t.started_at.is_none());
        assert!(t.completed_at.is_none());
        assert!(t.error_message.is_none());
        assert!(t.error_details.is_none());

        t.start_processing();
        t.fail(&TaskError::new("boom again"));
        assert!(!t.can_retry());
        assert!(!t.retry());
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn test_with_max_retries_clamps_retry_count() {
        let mut t = task();
        t.retry_count = 3;
        let t = t.with_max_retries(1);
        assert_eq!(t.retry_count, 1);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Retrying,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("paused"), Some(BatchStatus::Paused));
        assert_eq!(BatchStatus::parse("bogus"), None);
    }

    #[test]
    fn test_result_error_summary_and_rates() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(2);
        let mut result = BatchResult::new("b1", BatchStatus::Completed, start, end);
        result.total_tasks = 4;
        result.completed_tasks = 2;
        result.failed_tasks = 2;

        let mut a = task();
        a.fail(&TaskError::new("decode error"));
        let mut b = task();
        b.fail(&TaskError::new("decode error"));
        result.add_failed_task(&a);
        result.add_failed_task(&b);
        result.compute_rates();

        assert_eq!(result.error_summary.get("decode error"), Some(&2));
        assert_eq!(result.failed_task_details.len(), 2);
        assert_eq!(result.success_rate, 50.0);
        assert_eq!(result.throughput, 2.0);

        let snap = result.to_snapshot();
        assert_eq!(snap.progress_percentage, 100.0);
        assert_eq!(snap.success_rate, 50.0);
        assert_eq!(snap.pending_tasks, 0);
        assert!(snap.estimated_completion.is_none());
    }
}
