//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The platform job service refused or failed a request.
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid task description.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// The coordinator is no longer running.
    #[error("scheduler coordinator closed")]
    CoordinatorClosed,
}

/// Failures reported by a platform job service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The job service could not be reached.
    #[error("job service unavailable: {0}")]
    Unavailable(String),

    /// The job service rejected the job.
    #[error("job rejected: {0}")]
    Rejected(String),
}
