//! Builders that assemble orchestrator components from configuration.

pub mod orchestrator;

pub use orchestrator::{
    build_breakers, build_rate_limiters, Orchestrator, OrchestratorBuilder, JOB_POOL_WATCHDOG,
    JOB_QUEUE_PROCESSOR, JOB_RECOVERY_SWEEPER, RESOURCE_SESSION_POOL,
};
