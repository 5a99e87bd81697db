//! Tests for configuration validation

use std::time::Duration;

use publish_orchestrator::config::{
    BreakerConfig, OrchestratorConfig, PoolConfig, DEFAULT_BREAKER, DEFAULT_RATE_LIMIT,
    STUCK_MARGIN_SECS,
};

#[test]
fn test_default_config_is_valid() {
    let config = OrchestratorConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.breakers.contains_key(DEFAULT_BREAKER));
    assert!(config.rate_limits.contains_key(DEFAULT_RATE_LIMIT));
    assert_eq!(config.rate_limits[DEFAULT_RATE_LIMIT].limit, 4);
    assert_eq!(config.breakers[DEFAULT_BREAKER].failure_threshold, 15);
}

#[test]
fn test_pool_config_invalid_capacity() {
    let invalid = PoolConfig {
        capacity: 0,
        ..PoolConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_limits_conversion() {
    let limits = PoolConfig::default().limits();
    assert_eq!(limits.capacity, 3);
    assert_eq!(limits.max_operations, 50);
    assert_eq!(limits.lease_ceiling, Duration::from_secs(600));
}

#[test]
fn test_breaker_config_invalid_threshold() {
    let mut config = OrchestratorConfig::default();
    config.breakers.insert(
        "login".into(),
        BreakerConfig {
            failure_threshold: 0,
            cooldown_secs: 60,
        },
    );
    let err = config.validate().unwrap_err();
    assert!(err.contains("login"));
}

#[test]
fn test_unknown_rate_limit_reference() {
    let mut config = OrchestratorConfig::default();
    config.queue.rate_limit = "replies".into();
    assert!(config.validate().unwrap_err().contains("replies"));
}

#[test]
fn test_stuck_threshold_must_exceed_action_timeout() {
    let mut config = OrchestratorConfig::default();
    config.recovery.stuck_after_secs = config.queue.action_timeout_secs;
    assert!(config.validate().is_err());
}

#[test]
fn test_stuck_threshold_covers_pool_wait_and_action() {
    let mut config = OrchestratorConfig::default();
    config.pool.acquire_timeout_secs = 30;
    config.queue.action_timeout_secs = 120;

    config.recovery.stuck_after_secs = 121;
    let err = config.validate().unwrap_err();
    assert!(err.contains("acquire_timeout_secs"));

    config.recovery.stuck_after_secs = 150 + STUCK_MARGIN_SECS - 1;
    assert!(config.validate().is_err());

    config.recovery.stuck_after_secs = 150 + STUCK_MARGIN_SECS;
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "pool": { "capacity": 2 },
        "breakers": {
            "publish": { "failure_threshold": 5, "cooldown_secs": 120 },
            "scrape": { "failure_threshold": 10, "cooldown_secs": 60 }
        },
        "rate_limits": {
            "posts": { "limit": 6, "window_secs": 3600 }
        },
        "queue": { "interval_secs": 30, "batch_size": 2 },
        "scheduler": { "stall_check_secs": 0 }
    }"#;

    let config = OrchestratorConfig::from_json_str(json).unwrap();
    assert_eq!(config.pool.capacity, 2);
    assert_eq!(config.pool.max_operations, 50);
    assert_eq!(config.breakers.len(), 2);
    assert_eq!(config.queue.batch_size, 2);
    assert_eq!(config.queue.breaker, DEFAULT_BREAKER);
    assert_eq!(config.scheduler.settings().stall_check_interval, None);

    let processor = config.queue.processor_config(Duration::from_secs(10));
    assert_eq!(processor.batch_size, 2);
    assert_eq!(processor.acquire_timeout, Duration::from_secs(10));
}

#[test]
fn test_config_from_json_rejects_invalid() {
    assert!(OrchestratorConfig::from_json_str(r#"{ "pool": { "capacity": 0 } }"#).is_err());
    assert!(OrchestratorConfig::from_json_str("not json").is_err());
}
