//! Orchestrator configuration structures.
//!
//! All values are plain scalars read once at startup. Durations are given in
//! whole seconds, like the rest of the configuration surface.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::queue_processor::ProcessorConfig;
use crate::core::recovery::SweeperConfig;
use crate::core::scheduler::SchedulerSettings;
use crate::core::session_pool::PoolLimits;
use crate::util::serde::Priority;

/// Name of the default publishing breaker.
pub const DEFAULT_BREAKER: &str = "publish";
/// Name of the default publishing rate limit.
pub const DEFAULT_RATE_LIMIT: &str = "posts";
/// Slack between the longest in-flight attempt and the stuck threshold.
pub const STUCK_MARGIN_SECS: u64 = 60;

/// Session pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent sessions.
    pub capacity: usize,
    /// Operations served before a session is recycled.
    pub max_operations: u64,
    /// Session age limit in seconds.
    pub max_age_secs: u64,
    /// Hard lease ceiling in seconds before the watchdog reclaims a session.
    pub lease_ceiling_secs: u64,
    /// Pool wait bound for publish work, in seconds.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            max_operations: 50,
            max_age_secs: 30 * 60,
            lease_ceiling_secs: 10 * 60,
            acquire_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".into());
        }
        if self.max_operations == 0 {
            return Err("max_operations must be greater than 0".into());
        }
        if self.lease_ceiling_secs == 0 {
            return Err("lease_ceiling_secs must be greater than 0".into());
        }
        if self.acquire_timeout_secs == 0 {
            return Err("acquire_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Pool limits derived from this configuration.
    pub const fn limits(&self) -> PoolLimits {
        PoolLimits {
            capacity: self.capacity,
            max_operations: self.max_operations,
            max_age: Duration::from_secs(self.max_age_secs),
            lease_ceiling: Duration::from_secs(self.lease_ceiling_secs),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Seconds before a probe is admitted.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 15,
            cooldown_secs: 60,
        }
    }
}

/// Rolling-window rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 4,
            window_secs: 3600,
        }
    }
}

/// Queue processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Tick interval in seconds.
    pub interval_secs: u64,
    /// Explicit first-run offset in seconds.
    pub start_offset_secs: Option<u64>,
    /// Items attempted per tick.
    pub batch_size: usize,
    /// Pool priority for publishing (lower is more urgent).
    pub priority: u8,
    /// Action timeout in seconds.
    pub action_timeout_secs: u64,
    /// Resolved failures before an item fails for good.
    pub max_attempts: u32,
    /// Base retry back-off in seconds.
    pub retry_backoff_secs: u64,
    /// Breaker guarding the publish surface.
    pub breaker: String,
    /// Rate limit applied to publishing.
    pub rate_limit: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            start_offset_secs: None,
            batch_size: 1,
            priority: Priority::PUBLISH.value(),
            action_timeout_secs: 120,
            max_attempts: 3,
            retry_backoff_secs: 300,
            breaker: DEFAULT_BREAKER.to_string(),
            rate_limit: DEFAULT_RATE_LIMIT.to_string(),
        }
    }
}

impl QueueConfig {
    /// Processor settings; the pool wait bound comes from the pool section.
    pub const fn processor_config(&self, acquire_timeout: Duration) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.batch_size,
            priority: Priority(self.priority),
            acquire_timeout,
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }
}

/// Recovery sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Sweep interval in seconds.
    pub interval_secs: u64,
    /// Explicit first-run offset in seconds.
    pub start_offset_secs: Option<u64>,
    /// In-progress age in seconds after which an item is stuck.
    pub stuck_after_secs: u64,
    /// Items examined per sweep.
    pub batch_size: usize,
    /// Resolved failures before an item fails for good.
    pub max_attempts: u32,
    /// Verification timeout in seconds.
    pub verify_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            start_offset_secs: None,
            stuck_after_secs: 15 * 60,
            batch_size: 50,
            max_attempts: 3,
            verify_timeout_secs: 30,
        }
    }
}

impl RecoveryConfig {
    /// Sweeper settings.
    pub const fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            stuck_after: Duration::from_secs(self.stuck_after_secs),
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            verify_timeout: Duration::from_secs(self.verify_timeout_secs),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum spacing in seconds between first runs sharing a resource.
    pub min_spacing_secs: u64,
    /// Grace in seconds added to `interval * 1.5` for stall detection.
    pub stall_grace_secs: u64,
    /// Stall monitor cadence in seconds; 0 disables the monitor.
    pub stall_check_secs: u64,
    /// Pool watchdog cadence in seconds.
    pub watchdog_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_spacing_secs: 30,
            stall_grace_secs: 60,
            stall_check_secs: 60,
            watchdog_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    /// Scheduler settings.
    pub const fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            min_spacing: Duration::from_secs(self.min_spacing_secs),
            stall_grace: Duration::from_secs(self.stall_grace_secs),
            stall_check_interval: if self.stall_check_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(self.stall_check_secs))
            },
        }
    }
}

/// Schedule for a host-provided periodic job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Interval in seconds.
    pub interval_secs: u64,
    /// Explicit first-run offset in seconds.
    #[serde(default)]
    pub start_offset_secs: Option<u64>,
    /// Scarce resource shared with other jobs.
    #[serde(default)]
    pub resource: Option<String>,
    /// Disabled jobs are not registered.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Root orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Session pool.
    pub pool: PoolConfig,
    /// Circuit breakers keyed by failure domain.
    pub breakers: BTreeMap<String, BreakerConfig>,
    /// Rate limits keyed by action class.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Queue processor.
    pub queue: QueueConfig,
    /// Recovery sweeper.
    pub recovery: RecoveryConfig,
    /// Scheduler.
    pub scheduler: SchedulerConfig,
    /// Host job schedules keyed by job name.
    pub jobs: BTreeMap<String, JobConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            breakers: BTreeMap::from([(DEFAULT_BREAKER.to_string(), BreakerConfig::default())]),
            rate_limits: BTreeMap::from([(DEFAULT_RATE_LIMIT.to_string(), RateLimitConfig::default())]),
            queue: QueueConfig::default(),
            recovery: RecoveryConfig::default(),
            scheduler: SchedulerConfig::default(),
            jobs: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Validate every section and cross-references between them.
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        for (name, breaker) in &self.breakers {
            if breaker.failure_threshold == 0 {
                return Err(format!("breaker `{name}` invalid: failure_threshold must be greater than 0"));
            }
            if breaker.cooldown_secs == 0 {
                return Err(format!("breaker `{name}` invalid: cooldown_secs must be greater than 0"));
            }
        }
        for (name, limit) in &self.rate_limits {
            if limit.window_secs == 0 {
                return Err(format!("rate limit `{name}` invalid: window_secs must be greater than 0"));
            }
        }
        if !self.breakers.contains_key(&self.queue.breaker) {
            return Err(format!("queue references unknown breaker `{}`", self.queue.breaker));
        }
        if !self.rate_limits.contains_key(&self.queue.rate_limit) {
            return Err(format!("queue references unknown rate limit `{}`", self.queue.rate_limit));
        }
        if self.queue.interval_secs == 0 || self.queue.batch_size == 0 {
            return Err("queue interval_secs and batch_size must be greater than 0".into());
        }
        if self.queue.max_attempts == 0 || self.recovery.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        if self.queue.action_timeout_secs == 0 {
            return Err("queue action_timeout_secs must be greater than 0".into());
        }
        if self.recovery.interval_secs == 0 || self.recovery.stuck_after_secs == 0 {
            return Err("recovery interval_secs and stuck_after_secs must be greater than 0".into());
        }
        let in_flight = self
            .pool
            .acquire_timeout_secs
            .saturating_add(self.queue.action_timeout_secs)
            .saturating_add(STUCK_MARGIN_SECS);
        if self.recovery.stuck_after_secs < in_flight {
            // Pickup is stamped before the pool wait, so both bounds count.
            return Err(format!(
                "recovery stuck_after_secs must be at least pool acquire_timeout_secs + queue action_timeout_secs + {STUCK_MARGIN_SECS} ({in_flight})"
            ));
        }
        if self.scheduler.watchdog_interval_secs == 0 {
            return Err("scheduler watchdog_interval_secs must be greater than 0".into());
        }
        for (name, job) in &self.jobs {
            if job.interval_secs == 0 {
                return Err(format!("job `{name}` invalid: interval_secs must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read configuration from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_json_str(&input)
    }

    /// Load configuration from the environment.
    ///
    /// A `.env` file is loaded if present. `ORCH_CONFIG_FILE` names a JSON
    /// file to start from; `ORCH_*` variables then override single values.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var("ORCH_CONFIG_FILE") {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `ORCH_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(v) = parse_var(&lookup, "ORCH_POOL_CAPACITY")? {
            self.pool.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCH_ACQUIRE_TIMEOUT_SECS")? {
            self.pool.acquire_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCH_MAX_POSTS_PER_HOUR")? {
            let limit = self.rate_limits.entry(self.queue.rate_limit.clone()).or_default();
            limit.limit = v;
            limit.window_secs = 3600;
        }
        if let Some(v) = parse_var(&lookup, "ORCH_BREAKER_THRESHOLD")? {
            self.breakers.entry(self.queue.breaker.clone()).or_default().failure_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCH_BREAKER_COOLDOWN_SECS")? {
            self.breakers.entry(self.queue.breaker.clone()).or_default().cooldown_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCH_QUEUE_INTERVAL_SECS")? {
            self.queue.interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "ORCH_STUCK_AFTER_SECS")? {
            self.recovery.stuck_after_secs = v;
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}: cannot parse `{raw}`: {e}"))
        })
        .transpose()
}
