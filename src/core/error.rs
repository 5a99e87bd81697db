//! Error types for pool, scheduler, and external action operations.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the session pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No session became available within the caller's timeout.
    #[error("pool acquire timed out after {0:?}")]
    Timeout(Duration),
    /// The session provider could not materialize a new session.
    #[error("session creation failed: {0}")]
    SessionCreation(String),
    /// The pool has been shut down.
    #[error("pool has been shut down")]
    Shutdown,
}

/// Errors produced by the scheduler, stores, and configuration.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with the same name is already registered.
    #[error("job already registered: {0}")]
    DuplicateJob(String),
    /// Named job is not registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Storage backend failure with context.
    #[error("storage error: {0}")]
    Storage(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Failure reported by the external action collaborator.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// Temporary failure; the work item may be retried.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Non-retryable failure, e.g. content rejected by the platform.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The action exceeded its operation-level timeout.
    #[error("action timed out after {0:?}")]
    Timeout(Duration),
}

impl ActionError {
    /// Whether the work item should be retried after this failure.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// Whether this failure reflects external-surface health for breaker purposes.
    pub const fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
