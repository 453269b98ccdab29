// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayqError {
    /// The backing store could not be reached or rejected a command.
    /// Nothing was mutated; callers may retry.
    #[error("store unavailable: {0}")]
    Store(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(crate::JobId),

    /// The lease on a job expired and the store reassigned it. The caller
    /// must abandon the job and report nothing.
    #[error("lost lock on job {0}")]
    LostLock(crate::JobId),

    #[error("job execution failed: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),

    #[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, RelayqError>;
