use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BatchResult, ProgressSnapshot, Task, TaskStatus};

/// Fired once when a batch moves from `Created` to `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartedEvent {
    pub batch_id: String,
    pub total_tasks: usize,
    pub started_at: DateTime<Utc>,
}

/// Fired once per batch, after its [`BatchResult`] has been stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompletedEvent {
    pub result: BatchResult,
}

/// Fired when an attempt succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedEvent {
    pub batch_id: String,
    pub task: Task,
}

/// Fired for every failed attempt. `will_retry` tells whether the task
/// goes back to the pool or has failed for good.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedEvent {
    pub batch_id: String,
    pub task: Task,
    pub error: String,
    pub will_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressEventKind {
    TaskAdded,
    TaskStatusChanged,
    TrackerReset,
}

/// Structured record emitted by a [`ProgressTracker`](crate::ProgressTracker)
/// to its event subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub old_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub processing_time: Option<f64>,
}

impl ProgressEvent {
    pub(crate) fn task_added(batch_id: &str, task_id: &str) -> Self {
        Self {
            kind: ProgressEventKind::TaskAdded,
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            task_id: Some(task_id.to_string()),
            old_status: None,
            new_status: None,
            processing_time: None,
        }
    }

    pub(crate) fn status_changed(
        batch_id: &str,
        task_id: &str,
        old_status: TaskStatus,
        new_status: TaskStatus,
        processing_time: Option<f64>,
    ) -> Self {
        Self {
            kind: ProgressEventKind::TaskStatusChanged,
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            task_id: Some(task_id.to_string()),
            old_status: Some(old_status),
            new_status: Some(new_status),
            processing_time,
        }
    }

    pub(crate) fn reset(batch_id: &str) -> Self {
        Self {
            kind: ProgressEventKind::TrackerReset,
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            task_id: None,
            old_status: None,
            new_status: None,
            processing_time: None,
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An ordered list of subscribers for one event type.
///
/// Subscribers run on the thread that emits the event, without any internal
/// lock held. A panicking subscriber is logged and skipped; the remaining
/// subscribers still run.
pub struct CallbackList<E> {
    name: &'static str,
    callbacks: RwLock<Vec<Callback<E>>>,
}

impl<E> CallbackList<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(Arc::new(callback)),
            Err(e) => tracing::error!(event = self.name, "callback list poisoned: {}", e),
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber with `event`.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(e) => {
                tracing::error!(event = self.name, "callback list poisoned: {}", e);
                return;
            }
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(event = self.name, "callback panicked; continuing");
            }
        }
    }
}

/// The scheduler's four typed event channels.
pub struct SchedulerCallbacks {
    pub batch_start: CallbackList<BatchStartedEvent>,
    pub batch_complete: CallbackList<BatchCompletedEvent>,
    pub task_complete: CallbackList<TaskCompletedEvent>,
    pub task_failed: CallbackList<TaskFailedEvent>,
}

impl Default for SchedulerCallbacks {
    fn default() -> Self {
        Self {
            batch_start: CallbackList::new("on_batch_start"),
            batch_complete: CallbackList::new("on_batch_complete"),
            task_complete: CallbackList::new("on_task_complete"),
            task_failed: CallbackList::new("on_task_failed"),
        }
    }
}

/// A tracker's subscribers: full snapshots and raw transition events.
pub(crate) struct TrackerCallbacks {
    pub progress: CallbackList<ProgressSnapshot>,
    pub events: CallbackList<ProgressEvent>,
}

impl Default for TrackerCallbacks {
    fn default() -> Self {
        Self {
            progress: CallbackList::new("progress"),
            events: CallbackList::new("progress_event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let list: CallbackList<u32> = CallbackList::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = Arc::clone(&total);
            list.register(move |v: &u32| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        list.emit(&2);
        assert_eq!(list.len(), 3);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let list: CallbackList<u32> = CallbackList::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        list.register(|_: &u32| panic!("subscriber bug"));
        let c = Arc::clone(&calls);
        list.register(move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        list.emit(&1);
        list.emit(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_list() {
        let list: CallbackList<u32> = CallbackList::new("test");
        assert!(list.is_empty());
        list.emit(&1);
    }
}
