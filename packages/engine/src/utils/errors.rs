// packages/engine/src/utils/errors.rs
//! Engine error types
//!
//! Component operations return `Result<T, EngineError>`. Errors on the job
//! path never reach the dispatcher: the job handler folds them into a
//! [`JobResult`](crate::runtime::job::JobResult) variant.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workspace creation or input write failed
    #[error("Workspace setup failed: {0}")]
    WorkspaceSetup(String),

    /// An output artifact expected to exist is absent
    #[error("Output artifact missing: {}", .0.display())]
    OutputMissing(PathBuf),

    /// The tool process could not be started
    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// Waiting on a job exceeded the caller's time budget
    #[error("Execution timed out")]
    ExecutionTimeout,

    /// No worker slot could be obtained
    #[error("Worker pool exhausted")]
    PoolExhausted,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Reaper is no longer accepting work
    #[error("Reaper unavailable: {0}")]
    ReaperUnavailable(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}
