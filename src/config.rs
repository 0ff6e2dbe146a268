use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Per-batch execution policy.
///
/// Use [`BatchConfig::builder()`] for ergonomic construction, or
/// [`BatchConfig::default()`] for the stock policy (4 concurrent tasks,
/// 3 retries, 1s retry delay, 5 minute per-task timeout, auto-retry on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    /// Maximum tasks of this batch executing at once.
    pub max_concurrent_tasks: usize,

    /// Retry budget stamped onto every task at submission.
    pub max_retries: u32,

    /// Backoff before a failed task is re-dispatched.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    /// Upper bound on a single executor call. Expiry counts as a failure.
    #[serde(with = "duration_secs")]
    pub timeout_per_task: Duration,

    /// Re-dispatch failed tasks while their retry budget lasts.
    pub auto_retry: bool,

    /// Cancel every not-yet-started task once any task fails for good.
    pub stop_on_first_error: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout_per_task: Duration::from_secs(300),
            auto_retry: true,
            stop_on_first_error: false,
        }
    }
}

impl BatchConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.timeout_per_task.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "timeout_per_task must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BatchConfig`].
#[derive(Default)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.config.max_concurrent_tasks = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn with_timeout_per_task(mut self, timeout: Duration) -> Self {
        self.config.timeout_per_task = timeout;
        self
    }

    pub fn with_auto_retry(mut self, enabled: bool) -> Self {
        self.config.auto_retry = enabled;
        self
    }

    pub fn with_stop_on_first_error(mut self, enabled: bool) -> Self {
        self.config.stop_on_first_error = enabled;
        self
    }

    /// Build the final [`BatchConfig`].
    pub fn build(self) -> BatchConfig {
        self.config
    }
}

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_DURATION_WINDOW: usize = 100;

/// Scheduler-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Size of the worker pool shared by every batch of this scheduler.
    pub pool_size: usize,

    /// Policy applied to batches submitted without their own config.
    pub default_batch: BatchConfig,

    /// Capacity of each tracker's status-transition history.
    pub history_capacity: usize,

    /// Number of recent durations used for moving averages.
    pub duration_window: usize,

    /// SQLite file for the storage mirror. `None` = no mirror.
    pub db_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let default_batch = BatchConfig::default();
        Self {
            pool_size: default_batch.max_concurrent_tasks,
            default_batch,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            duration_window: DEFAULT_DURATION_WINDOW,
            db_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, SchedulerError> {
        let config: SchedulerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.pool_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.history_capacity == 0 || self.duration_window == 0 {
            return Err(SchedulerError::InvalidConfig(
                "tracker buffers need a non-zero capacity".to_string(),
            ));
        }
        self.default_batch.validate()
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
    pool_size_set: bool,
}

impl SchedulerConfigBuilder {
    /// Set the shared pool size. Defaults to the default batch's
    /// `max_concurrent_tasks`.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self.pool_size_set = true;
        self
    }

    pub fn with_default_batch(mut self, batch: BatchConfig) -> Self {
        self.config.default_batch = batch;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    pub fn with_duration_window(mut self, window: usize) -> Self {
        self.config.duration_window = window;
        self
    }

    /// Mirror batch and task state into a SQLite database at `path`.
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.config.db_path = Some(path);
        self
    }

    pub fn build(mut self) -> SchedulerConfig {
        if !self.pool_size_set {
            self.config.pool_size = self.config.default_batch.max_concurrent_tasks;
        }
        self.config
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
