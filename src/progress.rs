use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_DURATION_WINDOW, DEFAULT_HISTORY_CAPACITY};
use crate::error::TaskError;
use crate::events::{ProgressEvent, TrackerCallbacks};
use crate::types::{ProgressSnapshot, Task, TaskOutcome, TaskStatus};

/// One recorded status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub processing_time: Option<f64>,
}

/// Counts by status plus duration and error statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retrying: usize,
    pub avg_processing_time: f64,
    pub min_processing_time: f64,
    pub max_processing_time: f64,
    /// Error message -> number of tasks currently failed with it.
    pub error_breakdown: HashMap<String, usize>,
}

/// Headline rates for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub progress_percentage: f64,
    pub success_rate: f64,
    pub throughput: f64,
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: f64,
}

struct TrackerState {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    history: VecDeque<HistoryEntry>,
    durations: VecDeque<f64>,
    total_tasks: usize,
    started_at: DateTime<Utc>,
}

impl TrackerState {
    fn push_history(&mut self, capacity: usize, entry: HistoryEntry) {
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    fn push_duration(&mut self, window: usize, secs: f64) {
        while self.durations.len() >= window {
            self.durations.pop_front();
        }
        self.durations.push_back(secs);
    }

    fn average_duration(&self) -> f64 {
        if self.durations.is_empty() {
            0.0
        } else {
            self.durations.iter().sum::<f64>() / self.durations.len() as f64
        }
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    // Full scan on every call; fine for batches of a few thousand tasks.
    fn snapshot(&self, batch_id: &str, now: DateTime<Utc>) -> ProgressSnapshot {
        let completed = self.count(TaskStatus::Completed);
        let failed = self.count(TaskStatus::Failed);
        let cancelled = self.count(TaskStatus::Cancelled);
        let total = self.total_tasks.max(self.tasks.len());
        let processed = completed + failed + cancelled;
        let pending = total.saturating_sub(processed);

        let elapsed = seconds_between(self.started_at, now);
        let throughput = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };
        let estimated_completion = if throughput > 0.0 && pending > 0 {
            let remaining_ms = (pending as f64 / throughput * 1000.0) as i64;
            Some(now + chrono::Duration::milliseconds(remaining_ms))
        } else {
            None
        };

        let judged = completed + failed;
        ProgressSnapshot {
            batch_id: batch_id.to_string(),
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            cancelled_tasks: cancelled,
            pending_tasks: pending,
            progress_percentage: if total > 0 {
                processed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            success_rate: if judged > 0 {
                completed as f64 / judged as f64 * 100.0
            } else {
                0.0
            },
            elapsed_seconds: elapsed,
            estimated_completion,
            throughput,
            average_processing_time: self.average_duration(),
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Notifications produced by one committed change.
struct Notice {
    snapshot: Option<ProgressSnapshot>,
    events: Vec<ProgressEvent>,
}

/// Commit-ordered notifications waiting for delivery.
#[derive(Default)]
struct Dispatch {
    queue: VecDeque<Notice>,
    draining: bool,
}

/// Live state of one batch's tasks.
///
/// Every mutation happens under a single per-tracker lock. Notifications are
/// queued in commit order while that lock is held and delivered after it is
/// released, with no tracker lock held while a subscriber runs.
///
/// Subscribers may call back into the tracker or the scheduler, for
/// example to cancel the batch from a progress callback. Notifications caused
/// by such a call are delivered once the current subscriber returns. When
/// several threads commit changes at once, whichever is already delivering
/// also delivers the others' notifications.
pub struct ProgressTracker {
    batch_id: String,
    history_capacity: usize,
    duration_window: usize,
    state: Mutex<TrackerState>,
    callbacks: TrackerCallbacks,
    dispatch: Mutex<Dispatch>,
}

impl ProgressTracker {
    pub fn new(batch_id: &str, total_tasks: usize) -> Self {
        Self::with_capacity(
            batch_id,
            total_tasks,
            DEFAULT_HISTORY_CAPACITY,
            DEFAULT_DURATION_WINDOW,
        )
    }

    pub fn with_capacity(
        batch_id: &str,
        total_tasks: usize,
        history_capacity: usize,
        duration_window: usize,
    ) -> Self {
        tracing::debug!(batch_id, total_tasks, "created progress tracker");
        Self {
            batch_id: batch_id.to_string(),
            history_capacity: history_capacity.max(1),
            duration_window: duration_window.max(1),
            state: Mutex::new(TrackerState {
                tasks: HashMap::new(),
                order: Vec::new(),
                history: VecDeque::new(),
                durations: VecDeque::new(),
                total_tasks,
                started_at: Utc::now(),
            }),
            callbacks: TrackerCallbacks::default(),
            dispatch: Mutex::new(Dispatch::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a notice. Called with the state lock held so the queue follows
    /// commit order.
    fn enqueue(&self, notice: Notice) {
        self.lock_dispatch().queue.push_back(notice);
    }

    /// Deliver queued notices unless another call is already doing so.
    fn drain(&self) {
        {
            let mut dispatch = self.lock_dispatch();
            if dispatch.draining {
                return;
            }
            dispatch.draining = true;
        }

        loop {
            let next = {
                let mut dispatch = self.lock_dispatch();
                let next = dispatch.queue.pop_front();
                if next.is_none() {
                    dispatch.draining = false;
                }
                next
            };
            let Some(notice) = next else {
                break;
            };

            for event in &notice.events {
                self.callbacks.events.emit(event);
            }
            if let Some(snapshot) = &notice.snapshot {
                self.callbacks.progress.emit(snapshot);
            }
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn total_tasks(&self) -> usize {
        let state = self.lock();
        state.total_tasks.max(state.tasks.len())
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.lock().started_at
    }

    /// Restart the elapsed-time clock, typically when the batch starts.
    pub fn mark_started(&self) {
        self.lock().started_at = Utc::now();
    }

    /// Subscribe to a fresh snapshot after every recorded change.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressSnapshot) + Send + Sync + 'static,
    {
        self.callbacks.progress.register(callback);
    }

    /// Subscribe to raw transition events.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.callbacks.events.register(callback);
    }

    /// Register a task before execution begins. Adding an id twice is a
    /// no-op and returns `false`.
    pub fn add_task(&self, task: Task) -> bool {
        let task_id = task.id.clone();
        {
            let mut state = self.lock();
            if state.tasks.contains_key(&task_id) {
                return false;
            }
            state.order.push(task_id.clone());
            state.tasks.insert(task_id.clone(), task);
            self.enqueue(Notice {
                snapshot: None,
                events: vec![ProgressEvent::task_added(&self.batch_id, &task_id)],
            });
        }
        self.drain();
        true
    }

    /// Record a status transition for `task_id`.
    ///
    /// Only lifecycle edges are accepted: `Pending`/`Retrying` -> `Processing`,
    /// `Processing` -> `Completed`/`Failed`, `Failed` -> `Retrying` while
    /// budget remains, and any non-terminal state -> `Cancelled`. Timestamps
    /// and error fields follow the task state machine. Returns the new
    /// snapshot, or `None` if the task is unknown or the transition was
    /// refused.
    pub fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&TaskError>,
        duration: Option<f64>,
    ) -> Option<ProgressSnapshot> {
        self.transition(task_id, |task| {
            let old = task.status;
            if !old.can_transition_to(status) {
                tracing::warn!(
                    task_id = %task.id,
                    from = old.as_str(),
                    to = status.as_str(),
                    "refused invalid status transition"
                );
                return None;
            }
            match status {
                TaskStatus::Processing => task.start_processing(),
                TaskStatus::Completed => {
                    let outcome = TaskOutcome {
                        processing_time: duration,
                        ..TaskOutcome::default()
                    };
                    task.complete(&outcome, duration.unwrap_or(0.0));
                }
                TaskStatus::Failed => {
                    let fallback = TaskError::new(crate::types::UNKNOWN_ERROR);
                    task.fail(error.unwrap_or(&fallback));
                }
                TaskStatus::Retrying => {
                    if !task.retry() {
                        return None;
                    }
                }
                TaskStatus::Cancelled => task.cancel(),
                TaskStatus::Pending => return None,
            }
            Some(vec![(old, task.status, duration)])
        })
        .map(|(_, snapshot)| snapshot)
    }

    /// Atomically move a dispatchable task to `Processing`.
    ///
    /// Returns `None` if the task is unknown or not in `Pending`/`Retrying`,
    /// which is how the scheduler guarantees one attempt in flight per task.
    pub(crate) fn claim(&self, task_id: &str) -> Option<Task> {
        self.transition(task_id, |task| {
            if !task.status.is_dispatchable() {
                return None;
            }
            let old = task.status;
            task.start_processing();
            Some(vec![(old, TaskStatus::Processing, None)])
        })
        .map(|(task, _)| task)
    }

    /// Record a successful attempt.
    pub(crate) fn record_success(
        &self,
        task_id: &str,
        outcome: &TaskOutcome,
        measured_secs: f64,
    ) -> Option<Task> {
        self.transition(task_id, |task| {
            if task.status != TaskStatus::Processing {
                return None;
            }
            task.complete(outcome, measured_secs);
            Some(vec![(
                TaskStatus::Processing,
                TaskStatus::Completed,
                task.processing_time,
            )])
        })
        .map(|(task, _)| task)
    }

    /// Record a failed attempt. When `allow_retry` is set and the task has
    /// budget left, `Failed` and `Retrying` are committed together so no
    /// snapshot ever counts the task as failed.
    ///
    /// Returns the task as it looked when the attempt failed, and whether it
    /// was moved to `Retrying`.
    pub(crate) fn record_failure(
        &self,
        task_id: &str,
        error: &TaskError,
        allow_retry: bool,
    ) -> Option<(Task, bool)> {
        let mut failed_view = None;
        let committed = self.transition(task_id, |task| {
            if task.status != TaskStatus::Processing {
                return None;
            }
            task.fail(error);
            failed_view = Some(task.clone());
            let mut steps = vec![(TaskStatus::Processing, TaskStatus::Failed, None)];
            if allow_retry && task.retry() {
                steps.push((TaskStatus::Failed, TaskStatus::Retrying, None));
            }
            Some(steps)
        });
        let (task, _) = committed?;
        let retried = task.status == TaskStatus::Retrying;
        failed_view.map(|view| (view, retried))
    }

    /// Cancel one task if it has not started yet.
    pub(crate) fn cancel_if_unstarted(&self, task_id: &str) -> bool {
        self.transition(task_id, |task| {
            if !task.status.is_dispatchable() {
                return None;
            }
            let old = task.status;
            task.cancel();
            Some(vec![(old, TaskStatus::Cancelled, None)])
        })
        .is_some()
    }

    /// Cancel every task that is not processing and not terminal.
    /// Returns the ids that were cancelled.
    pub(crate) fn cancel_unstarted(&self) -> Vec<String> {
        let mut events = Vec::new();
        let mut cancelled = Vec::new();
        let now = Utc::now();
        {
            let mut state = self.lock();
            let ids: Vec<String> = state
                .order
                .iter()
                .filter(|id| {
                    state
                        .tasks
                        .get(*id)
                        .is_some_and(|t| t.status.is_dispatchable())
                })
                .cloned()
                .collect();

            for id in ids {
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                let old = task.status;
                task.cancel();
                let entry = HistoryEntry {
                    task_id: id.clone(),
                    old_status: old,
                    new_status: TaskStatus::Cancelled,
                    timestamp: now,
                    processing_time: None,
                };
                state.push_history(self.history_capacity, entry);
                events.push(ProgressEvent::status_changed(
                    &self.batch_id,
                    &id,
                    old,
                    TaskStatus::Cancelled,
                    None,
                ));
                cancelled.push(id);
            }

            if cancelled.is_empty() {
                return cancelled;
            }
            self.enqueue(Notice {
                snapshot: Some(state.snapshot(&self.batch_id, now)),
                events,
            });
        }

        self.drain();
        cancelled
    }

    /// Apply `mutate` to one task under the lock, record every step it
    /// reports in the history, then notify subscribers.
    fn transition<F>(&self, task_id: &str, mutate: F) -> Option<(Task, ProgressSnapshot)>
    where
        F: FnOnce(&mut Task) -> Option<Vec<(TaskStatus, TaskStatus, Option<f64>)>>,
    {
        let now = Utc::now();
        let (task, snapshot) = {
            let mut state = self.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                tracing::warn!(batch_id = %self.batch_id, task_id, "status update for unknown task");
                return None;
            };
            let steps = mutate(task)?;
            let task = task.clone();

            let mut events = Vec::with_capacity(steps.len());
            for (old, new, duration) in steps {
                state.push_history(
                    self.history_capacity,
                    HistoryEntry {
                        task_id: task_id.to_string(),
                        old_status: old,
                        new_status: new,
                        timestamp: now,
                        processing_time: duration,
                    },
                );
                if let Some(secs) = duration {
                    state.push_duration(self.duration_window, secs);
                }
                events.push(ProgressEvent::status_changed(
                    &self.batch_id,
                    task_id,
                    old,
                    new,
                    duration,
                ));
                tracing::debug!(
                    batch_id = %self.batch_id,
                    task_id,
                    from = old.as_str(),
                    to = new.as_str(),
                    "task status changed"
                );
            }

            let snapshot = state.snapshot(&self.batch_id, now);
            self.enqueue(Notice {
                snapshot: Some(snapshot.clone()),
                events,
            });
            (task, snapshot)
        };

        self.drain();
        Some((task, snapshot))
    }

    /// Point-in-time aggregate view.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot(&self.batch_id, Utc::now())
    }

    /// `now + pending / throughput`, or `None` when nothing is pending or
    /// nothing has finished yet.
    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        self.snapshot().estimated_completion
    }

    pub fn task_statistics(&self) -> TaskStatistics {
        let state = self.lock();
        let mut stats = TaskStatistics {
            total_tasks: state.total_tasks.max(state.tasks.len()),
            ..TaskStatistics::default()
        };

        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => {
                    stats.failed += 1;
                    if let Some(message) = &task.error_message {
                        *stats.error_breakdown.entry(message.clone()).or_insert(0) += 1;
                    }
                }
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Retrying => stats.retrying += 1,
            }
        }

        if !state.durations.is_empty() {
            stats.avg_processing_time = state.average_duration();
            stats.min_processing_time = state.durations.iter().copied().fold(f64::MAX, f64::min);
            stats.max_processing_time = state.durations.iter().copied().fold(0.0, f64::max);
        }
        stats
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let now = Utc::now();
        let snapshot = self.lock().snapshot(&self.batch_id, now);
        PerformanceMetrics {
            progress_percentage: snapshot.progress_percentage,
            success_rate: snapshot.success_rate,
            throughput: snapshot.throughput,
            elapsed_seconds: snapshot.elapsed_seconds,
            estimated_remaining_seconds: snapshot
                .estimated_completion
                .map(|eta| seconds_between(now, eta))
                .unwrap_or(0.0),
        }
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.lock().tasks.get(task_id).map(|t| t.status)
    }

    /// All tracked tasks, in the order they were added.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<Task> {
        self.tasks_with_status(TaskStatus::Failed)
    }

    pub fn completed_tasks(&self) -> Vec<Task> {
        self.tasks_with_status(TaskStatus::Completed)
    }

    pub fn processing_tasks(&self) -> Vec<Task> {
        self.tasks_with_status(TaskStatus::Processing)
    }

    /// The most recent `limit` transitions, oldest first.
    pub fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Forget every task, transition and duration sample.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.tasks.clear();
            state.order.clear();
            state.history.clear();
            state.durations.clear();
            state.started_at = Utc::now();
            self.enqueue(Notice {
                snapshot: None,
                events: vec![ProgressEvent::reset(&self.batch_id)],
            });
        }
        tracing::info!(batch_id = %self.batch_id, "progress tracker reset");
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn make_tasks(count: usize) -> Vec<Task> {
        (0..count)
            .map(|i| {
                Task::new(format!("in/{}.wav", i), format!("out/{}.wav", i))
                    .unwrap()
                    .with_max_retries(1)
            })
            .collect()
    }

    fn tracker_with(count: usize) -> (ProgressTracker, Vec<String>) {
        let tracker = ProgressTracker::new("batch-1", count);
        let tasks = make_tasks(count);
        let ids = tasks.iter().map(|t| t.id.clone()).collect();
        for task in tasks {
            assert!(tracker.add_task(task));
        }
        (tracker, ids)
    }

    #[test]
    fn test_add_task_is_idempotent() {
        let tracker = ProgressTracker::new("b", 1);
        let task = make_tasks(1).remove(0);
        assert!(tracker.add_task(task.clone()));
        assert!(!tracker.add_task(task));
        assert_eq!(tracker.tasks().len(), 1);
    }

    #[test]
    fn test_counts_and_percentage() {
        let (tracker, ids) = tracker_with(4);
        tracker.update_status(&ids[0], TaskStatus::Processing, None, None);
        tracker.update_status(&ids[0], TaskStatus::Completed, None, Some(1.0));
        tracker.update_status(&ids[1], TaskStatus::Processing, None, None);
        let err = TaskError::new("bad header");
        tracker.update_status(&ids[1], TaskStatus::Failed, Some(&err), Some(3.0));
        tracker.update_status(&ids[2], TaskStatus::Cancelled, None, None);

        let snap = tracker.snapshot();
        assert_eq!(snap.total_tasks, 4);
        assert_eq!(snap.completed_tasks, 1);
        assert_eq!(snap.failed_tasks, 1);
        assert_eq!(snap.cancelled_tasks, 1);
        assert_eq!(snap.pending_tasks, 1);
        assert_eq!(snap.progress_percentage, 75.0);
        assert_eq!(snap.success_rate, 50.0);
        assert_eq!(snap.average_processing_time, 2.0);

        let stats = tracker.task_statistics();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.min_processing_time, 1.0);
        assert_eq!(stats.max_processing_time, 3.0);
        assert_eq!(stats.error_breakdown.get("bad header"), Some(&1));
    }

    #[test]
    fn test_unknown_task_update_is_ignored() {
        let (tracker, _) = tracker_with(1);
        assert!(tracker
            .update_status("missing", TaskStatus::Completed, None, None)
            .is_none());
        assert_eq!(tracker.history_len(), 0);
    }

    #[test]
    fn test_retry_refused_without_budget() {
        let tracker = ProgressTracker::new("b", 1);
        let task = make_tasks(1).remove(0).with_max_retries(0);
        let id = task.id.clone();
        tracker.add_task(task);
        tracker.update_status(&id, TaskStatus::Processing, None, None);
        tracker.update_status(&id, TaskStatus::Failed, None, None);
        assert!(tracker
            .update_status(&id, TaskStatus::Retrying, None, None)
            .is_none());
        assert_eq!(tracker.task_status(&id), Some(TaskStatus::Failed));
        assert_eq!(
            tracker.task(&id).unwrap().error_message.as_deref(),
            Some(crate::types::UNKNOWN_ERROR)
        );
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let tracker = ProgressTracker::with_capacity("b", 20, 5, 3);
        for (i, task) in make_tasks(20).into_iter().enumerate() {
            let id = task.id.clone();
            tracker.add_task(task);
            tracker.update_status(&id, TaskStatus::Processing, None, None);
            tracker.update_status(&id, TaskStatus::Completed, None, Some(i as f64));
        }
        assert_eq!(tracker.history_len(), 5);
        let recent = tracker.recent_history(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].new_status, TaskStatus::Completed);
        assert_eq!(recent[1].processing_time, Some(19.0));
        // window holds 17, 18, 19
        assert_eq!(tracker.snapshot().average_processing_time, 18.0);
    }

    #[test]
    fn test_update_status_refuses_edges_outside_the_lifecycle() {
        let (tracker, ids) = tracker_with(4);
        let refused = |id: &str, status| tracker.update_status(id, status, None, None).is_none();

        // pending
        assert!(refused(&ids[0], TaskStatus::Completed));
        assert!(refused(&ids[0], TaskStatus::Failed));
        assert!(refused(&ids[0], TaskStatus::Retrying));
        assert!(refused(&ids[0], TaskStatus::Pending));

        // processing cannot go back to pending or skip to retrying
        tracker.update_status(&ids[0], TaskStatus::Processing, None, None);
        assert!(refused(&ids[0], TaskStatus::Pending));
        assert!(refused(&ids[0], TaskStatus::Retrying));
        assert!(refused(&ids[0], TaskStatus::Processing));
        assert_eq!(tracker.task_status(&ids[0]), Some(TaskStatus::Processing));

        // completed is final, and completed_at is set once
        tracker.update_status(&ids[0], TaskStatus::Completed, None, Some(0.5));
        let completed_at = tracker.task(&ids[0]).unwrap().completed_at;
        assert!(completed_at.is_some());
        for status in [
            TaskStatus::Processing,
            TaskStatus::Pending,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Retrying,
        ] {
            assert!(refused(&ids[0], status));
        }
        let task = tracker.task(&ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, completed_at);

        // failed may only be retried
        tracker.update_status(&ids[1], TaskStatus::Processing, None, None);
        tracker.update_status(&ids[1], TaskStatus::Failed, None, None);
        assert!(refused(&ids[1], TaskStatus::Processing));
        assert!(refused(&ids[1], TaskStatus::Completed));
        assert!(refused(&ids[1], TaskStatus::Cancelled));
        assert_eq!(tracker.task_status(&ids[1]), Some(TaskStatus::Failed));

        // cancelled is final
        tracker.update_status(&ids[2], TaskStatus::Cancelled, None, None);
        assert!(refused(&ids[2], TaskStatus::Processing));
        assert!(refused(&ids[2], TaskStatus::Pending));
        assert_eq!(tracker.task_status(&ids[2]), Some(TaskStatus::Cancelled));

        // refused updates leave no history
        assert_eq!(tracker.history_len(), 5);
    }

    #[test]
    fn test_retrying_task_can_be_redispatched_or_cancelled() {
        let (tracker, ids) = tracker_with(2);
        for id in &ids {
            tracker.update_status(id, TaskStatus::Processing, None, None);
            tracker.update_status(id, TaskStatus::Failed, None, None);
            assert!(tracker
                .update_status(id, TaskStatus::Retrying, None, None)
                .is_some());
        }
        assert!(tracker
            .update_status(&ids[0], TaskStatus::Processing, None, None)
            .is_some());
        assert!(tracker
            .update_status(&ids[1], TaskStatus::Cancelled, None, None)
            .is_some());
        assert_eq!(tracker.task(&ids[1]).unwrap().retry_count, 1);
    }

    #[test]
    fn test_claim_only_dispatchable_tasks() {
        let (tracker, ids) = tracker_with(1);
        let claimed = tracker.claim(&ids[0]).unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert!(claimed.started_at.is_some());
        assert!(tracker.claim(&ids[0]).is_none());
    }

    #[test]
    fn test_record_failure_with_retry_never_counts_failed() {
        let (tracker, ids) = tracker_with(1);
        let seen_failed = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen_failed);
        tracker.on_progress(move |snap| {
            s.fetch_max(snap.failed_tasks, Ordering::SeqCst);
        });

        tracker.claim(&ids[0]).unwrap();
        let (view, retried) = tracker
            .record_failure(&ids[0], &TaskError::new("flaky"), true)
            .unwrap();
        assert!(retried);
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error_message.as_deref(), Some("flaky"));

        let task = tracker.task(&ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert_eq!(seen_failed.load(Ordering::SeqCst), 0);

        let history = tracker.recent_history(10);
        let statuses: Vec<TaskStatus> = history.iter().map(|h| h.new_status).collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Processing,
                TaskStatus::Failed,
                TaskStatus::Retrying
            ]
        );

        // second failure exhausts the budget of 1
        tracker.claim(&ids[0]).unwrap();
        let (_, retried) = tracker
            .record_failure(&ids[0], &TaskError::new("flaky"), true)
            .unwrap();
        assert!(!retried);
        assert_eq!(tracker.task_status(&ids[0]), Some(TaskStatus::Failed));
        assert_eq!(tracker.task(&ids[0]).unwrap().retry_count, 1);
    }

    #[test]
    fn test_record_success_requires_processing() {
        let (tracker, ids) = tracker_with(1);
        assert!(tracker
            .record_success(&ids[0], &TaskOutcome::success(), 0.1)
            .is_none());
        tracker.claim(&ids[0]);
        let done = tracker
            .record_success(&ids[0], &TaskOutcome::success().with_output_size(9), 0.1)
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output_size, Some(9));
    }

    #[test]
    fn test_cancel_unstarted_skips_processing() {
        let (tracker, ids) = tracker_with(3);
        tracker.claim(&ids[0]);
        let cancelled = tracker.cancel_unstarted();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(tracker.task_status(&ids[0]), Some(TaskStatus::Processing));
        assert_eq!(tracker.task_status(&ids[1]), Some(TaskStatus::Cancelled));
        assert!(tracker.cancel_unstarted().is_empty());
    }

    #[test]
    fn test_progress_callbacks_see_monotonic_percentage() {
        let (tracker, ids) = tracker_with(5);
        let last = Arc::new(Mutex::new(0.0f64));
        let violations = Arc::new(AtomicUsize::new(0));
        let (l, v) = (Arc::clone(&last), Arc::clone(&violations));
        tracker.on_progress(move |snap| {
            let mut last = l.lock().unwrap();
            if snap.progress_percentage < *last {
                v.fetch_add(1, Ordering::SeqCst);
            }
            *last = snap.progress_percentage;
        });

        for id in &ids {
            tracker.claim(id);
            tracker.record_success(id, &TaskOutcome::success(), 0.01);
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(*last.lock().unwrap(), 100.0);
    }

    #[test]
    fn test_progress_callback_may_cancel_the_rest() {
        let (tracker, ids) = tracker_with(3);
        let tracker = Arc::new(tracker);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (t, s) = (Arc::downgrade(&tracker), Arc::clone(&seen));
        tracker.on_progress(move |snap| {
            s.lock().unwrap().push(snap.progress_percentage);
            if snap.completed_tasks >= 1 {
                if let Some(tracker) = t.upgrade() {
                    tracker.cancel_unstarted();
                }
            }
        });

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker = Arc::clone(&tracker);
        let first = ids[0].clone();
        std::thread::spawn(move || {
            worker.claim(&first);
            worker.record_success(&first, &TaskOutcome::success(), 0.01);
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("subscriber re-entering the tracker blocked");

        assert_eq!(tracker.task_status(&ids[1]), Some(TaskStatus::Cancelled));
        assert_eq!(tracker.task_status(&ids[2]), Some(TaskStatus::Cancelled));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*seen.last().unwrap(), 100.0);
    }

    #[test]
    fn test_event_callbacks_receive_transitions() {
        let tracker = ProgressTracker::new("b", 1);
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&kinds);
        tracker.on_event(move |event| k.lock().unwrap().push(event.kind));

        let task = make_tasks(1).remove(0);
        let id = task.id.clone();
        tracker.add_task(task);
        tracker.update_status(&id, TaskStatus::Processing, None, None);
        tracker.reset();

        use crate::events::ProgressEventKind::*;
        assert_eq!(
            *kinds.lock().unwrap(),
            vec![TaskAdded, TaskStatusChanged, TrackerReset]
        );
        assert!(tracker.tasks().is_empty());
    }

    #[test]
    fn test_eta_none_until_something_finishes() {
        let (tracker, ids) = tracker_with(3);
        assert!(tracker.estimated_completion().is_none());

        std::thread::sleep(std::time::Duration::from_millis(20));
        tracker.claim(&ids[0]);
        tracker.record_success(&ids[0], &TaskOutcome::success(), 0.01);

        let snap = tracker.snapshot();
        assert!(snap.throughput > 0.0);
        let eta = tracker.estimated_completion().unwrap();
        assert!(eta > Utc::now());
        assert!(tracker.performance_metrics().estimated_remaining_seconds > 0.0);
    }
}
