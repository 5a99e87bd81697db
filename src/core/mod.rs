//! Orchestration primitives: pool, breaker, limiter, scheduler, and the work item state machine.

pub mod action;
pub mod audit;
pub mod circuit_breaker;
pub mod error;
pub mod queue_processor;
pub mod rate_limiter;
pub mod recovery;
pub mod scheduler;
pub mod session_pool;
pub mod work_item;

pub use action::{ActionReceipt, Lookup, PublishAction, Verification, WorkPayload};
pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use error::{ActionError, AppResult, PoolError, SchedulerError};
pub use queue_processor::{ProcessorConfig, ProcessorStats, QueueProcessor, TickOutcome, TickSummary};
pub use rate_limiter::{Admission, RateLimiter, RateSnapshot, RateWindow};
pub use recovery::{RecoverySweeper, SweepSummary, SweeperConfig};
pub use scheduler::{
    stagger_offsets, FnTask, Heartbeat, HeartbeatSink, JobDescriptor, JobOutcome, JobScheduler,
    JobSpec, PeriodicTask, SchedulerSettings, Spawn, StallReport,
};
pub use session_pool::{
    PoolHealth, PoolLimits, PoolSession, PoolWatchdog, SessionLease, SessionPool, SessionProvider,
    SessionState,
};
pub use work_item::{
    StatusCounts, StatusUpdate, UpdateOutcome, WorkItem, WorkItemStore, WorkStatus,
};
