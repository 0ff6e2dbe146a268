use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{DEFAULT_DURATION_WINDOW, DEFAULT_HISTORY_CAPACITY};
use crate::progress::ProgressTracker;
use crate::types::ProgressSnapshot;

/// Owns the progress trackers of one scheduler, keyed by batch id.
pub struct TrackerRegistry {
    trackers: Mutex<HashMap<String, Arc<ProgressTracker>>>,
    history_capacity: usize,
    duration_window: usize,
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY, DEFAULT_DURATION_WINDOW)
    }

    /// Trackers created by this registry use the given buffer sizes.
    pub fn with_capacity(history_capacity: usize, duration_window: usize) -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
            history_capacity,
            duration_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ProgressTracker>>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a tracker for `batch_id`, replacing any previous one.
    pub fn create(&self, batch_id: &str, total_tasks: usize) -> Arc<ProgressTracker> {
        let tracker = Arc::new(ProgressTracker::with_capacity(
            batch_id,
            total_tasks,
            self.history_capacity,
            self.duration_window,
        ));
        if self
            .lock()
            .insert(batch_id.to_string(), Arc::clone(&tracker))
            .is_some()
        {
            tracing::warn!(batch_id, "replaced existing progress tracker");
        }
        tracker
    }

    pub fn get(&self, batch_id: &str) -> Option<Arc<ProgressTracker>> {
        self.lock().get(batch_id).cloned()
    }

    pub fn remove(&self, batch_id: &str) -> Option<Arc<ProgressTracker>> {
        self.lock().remove(batch_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop trackers whose tasks are all terminal and which started more
    /// than `max_age` ago. Returns the removed batch ids.
    pub fn cleanup_completed(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();

        let mut trackers = self.lock();
        let expired: Vec<String> = trackers
            .iter()
            .filter(|(_, tracker)| {
                tracker.snapshot().is_reconciled() && older_than(tracker.started_at(), now, max_age)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            trackers.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "cleaned up completed trackers");
        }
        expired
    }

    /// Snapshot of every tracked batch.
    pub fn all_snapshots(&self) -> HashMap<String, ProgressSnapshot> {
        let trackers: Vec<Arc<ProgressTracker>> = self.lock().values().cloned().collect();
        trackers
            .into_iter()
            .map(|t| (t.batch_id().to_string(), t.snapshot()))
            .collect()
    }
}

/// Whether `at` lies at least `max_age` before `now`.
pub(crate) fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    (now - at).to_std().is_ok_and(|age| age >= max_age)
}
