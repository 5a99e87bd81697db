//! Tests for error types

use std::time::Duration;

use publish_orchestrator::core::{ActionError, PoolError, SchedulerError};

#[test]
fn test_pool_timeout_error() {
    let err = PoolError::Timeout(Duration::from_secs(30));
    assert_eq!(err.to_string(), "pool acquire timed out after 30s");
}

#[test]
fn test_session_creation_error() {
    let err = PoolError::SessionCreation("browser launch failed".into());
    assert!(err.to_string().contains("browser launch failed"));
}

#[test]
fn test_duplicate_job_error() {
    let err = SchedulerError::DuplicateJob("queue-processor".into());
    assert_eq!(err.to_string(), "job already registered: queue-processor");
}

#[test]
fn test_action_error_classification() {
    assert!(ActionError::Transient("502".into()).is_retryable());
    assert!(ActionError::Timeout(Duration::from_secs(1)).is_retryable());
    assert!(!ActionError::Permanent("rejected".into()).is_retryable());
    assert!(!ActionError::Permanent("rejected".into()).counts_against_breaker());
    assert!(ActionError::Timeout(Duration::from_secs(1)).counts_against_breaker());
}
