use thiserror::Error;

/// Errors returned by the scheduler's fallible operations.
///
/// Task-level execution failures are not represented here; those are
/// recorded on the task itself as a [`TaskError`].
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Batch must contain at least one task")]
    EmptyBatch,

    #[error("Batch already exists: {0}")]
    DuplicateBatch(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scheduler is shut down")]
    ShutDown,

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Other(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reported by a [`TaskExecutor`](crate::TaskExecutor).
///
/// Carries a human-readable message (used as the error-histogram key) and
/// optional structured details passed through untouched to the task record.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::new(format!("{:#}", err))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::new(err.to_string()).with_details(serde_json::json!({
            "kind": format!("{:?}", err.kind()),
        }))
    }
}
