//! Optional `tracing` subscriber setup for binaries and demos.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. [`init_logging`] is a convenience for the
//! common cases.

use std::str::FromStr;

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log format: {0} (expected: text|json)")]
    InvalidFormat(String),
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("Logging has already been initialized")]
    AlreadyInitialized,
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingFormat {
    Text,
    Json,
}

impl FromStr for LoggingFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LoggingFormat::Text),
            "json" => Ok(LoggingFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LoggingFormat,
    /// An `EnvFilter` directive, e.g. `"info"` or `"batch_scheduler=debug"`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LoggingFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LoggingFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

/// Install a global subscriber. Fails if one is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = make_filter(&cfg.level)?;
    match cfg.format {
        LoggingFormat::Text => {
            let layer = fmt::layer()
                .with_ansi(cfg.use_color)
                .with_target(cfg.with_targets);
            init_with(tracing_subscriber::registry().with(filter).with(layer))
        }
        LoggingFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(cfg.with_targets);
            init_with(tracing_subscriber::registry().with(filter).with(layer))
        }
    }
}

fn make_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(level).map_err(|_| LoggingError::InvalidLogLevel(level.to_string()))
}

fn init_with<S>(subscriber: S) -> Result<(), LoggingError>
where
    S: Subscriber + Send + Sync + 'static,
{
    subscriber.try_init().map_err(|e| {
        let msg = e.to_string();
        if msg.contains("SetGlobalDefaultError") || msg.contains("global default") {
            LoggingError::AlreadyInitialized
        } else {
            LoggingError::InitializationFailed(msg)
        }
    })
}
