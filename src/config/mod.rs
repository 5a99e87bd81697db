//! Configuration models for the pool, breakers, limiters, and jobs.

pub mod orchestrator;

pub use orchestrator::{
    BreakerConfig, JobConfig, OrchestratorConfig, PoolConfig, QueueConfig, RateLimitConfig,
    RecoveryConfig, SchedulerConfig, DEFAULT_BREAKER, DEFAULT_RATE_LIMIT, STUCK_MARGIN_SECS,
};
