//! Assemble the orchestrator from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::core::{
    CircuitBreaker, HeartbeatSink, JobScheduler, JobSpec, PeriodicTask, PoolWatchdog,
    PublishAction, QueueProcessor, RateLimiter, RecoverySweeper, SchedulerError, SessionPool,
    SessionProvider, SharedAuditSink, Spawn, WorkItemStore, WorkPayload,
};
use crate::runtime::api::{self, Health, StatusReport};
use crate::util::clock::{system_clock, SharedClock};

/// Job name of the queue processor.
pub const JOB_QUEUE_PROCESSOR: &str = "queue-processor";
/// Job name of the recovery sweeper.
pub const JOB_RECOVERY_SWEEPER: &str = "recovery-sweeper";
/// Job name of the pool watchdog.
pub const JOB_POOL_WATCHDOG: &str = "pool-watchdog";
/// Resource group of jobs that lease pool sessions.
pub const RESOURCE_SESSION_POOL: &str = "session-pool";

/// Build one breaker per configured failure domain.
pub fn build_breakers(
    cfg: &OrchestratorConfig,
    clock: &SharedClock,
    audit: Option<&SharedAuditSink>,
) -> BTreeMap<String, Arc<CircuitBreaker>> {
    cfg.breakers
        .iter()
        .map(|(name, b)| {
            let breaker = CircuitBreaker::new(
                name.clone(),
                b.failure_threshold,
                Duration::from_secs(b.cooldown_secs),
                Arc::clone(clock),
            );
            let breaker = match audit {
                Some(sink) => breaker.with_audit(Arc::clone(sink)),
                None => breaker,
            };
            (name.clone(), Arc::new(breaker))
        })
        .collect()
}

/// Build one limiter per configured action class.
pub fn build_rate_limiters(cfg: &OrchestratorConfig, clock: &SharedClock) -> BTreeMap<String, Arc<RateLimiter>> {
    cfg.rate_limits
        .iter()
        .map(|(name, l)| {
            let limiter = RateLimiter::new(
                name.clone(),
                l.limit,
                Duration::from_secs(l.window_secs),
                Arc::clone(clock),
            );
            (name.clone(), Arc::new(limiter))
        })
        .collect()
}

/// Optional collaborators for [`Orchestrator`] assembly.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    clock: SharedClock,
    audit: Option<SharedAuditSink>,
    heartbeat_sink: Option<Arc<dyn HeartbeatSink>>,
}

impl OrchestratorBuilder {
    /// Start from a configuration; uses the system clock and no sinks.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            audit: None,
            heartbeat_sink: None,
        }
    }

    /// Use `clock` for all wall-clock reasoning.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Record transitions and breaker changes to `audit`.
    #[must_use]
    pub fn audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Mirror job heartbeats to `sink`.
    #[must_use]
    pub fn heartbeat_sink(mut self, sink: Arc<dyn HeartbeatSink>) -> Self {
        self.heartbeat_sink = Some(sink);
        self
    }

    /// Build every component and register the built-in jobs.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if the configuration does not
    /// validate.
    pub fn build<P, SP, S>(
        self,
        provider: SP,
        store: Arc<dyn WorkItemStore<P>>,
        action: Arc<dyn PublishAction<P, SP::Session>>,
        spawner: S,
    ) -> Result<Orchestrator<P, SP, S>, SchedulerError>
    where
        P: WorkPayload,
        SP: SessionProvider,
        S: Spawn + Clone + Send + Sync + 'static,
    {
        let Self {
            config,
            clock,
            audit,
            heartbeat_sink,
        } = self;
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let pool = SessionPool::new(config.pool.limits(), provider);
        let breakers = build_breakers(&config, &clock, audit.as_ref());
        let rate_limiters = build_rate_limiters(&config, &clock);
        let breaker = breakers
            .get(&config.queue.breaker)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidConfig(format!("unknown breaker `{}`", config.queue.breaker)))?;
        let limiter = rate_limiters
            .get(&config.queue.rate_limit)
            .cloned()
            .ok_or_else(|| {
                SchedulerError::InvalidConfig(format!("unknown rate limit `{}`", config.queue.rate_limit))
            })?;

        let processor = QueueProcessor::new(
            config
                .queue
                .processor_config(Duration::from_secs(config.pool.acquire_timeout_secs)),
            pool.clone(),
            Arc::clone(&store),
            Arc::clone(&action),
            breaker,
            limiter,
            Arc::clone(&clock),
        );
        let sweeper = RecoverySweeper::new(
            config.recovery.sweeper_config(),
            Arc::clone(&store),
            action,
            Arc::clone(&clock),
        );
        let (processor, sweeper) = match audit.as_ref() {
            Some(sink) => (
                processor.with_audit(Arc::clone(sink)),
                sweeper.with_audit(Arc::clone(sink)),
            ),
            None => (processor, sweeper),
        };
        let processor = Arc::new(processor);
        let sweeper = Arc::new(sweeper);

        let scheduler = JobScheduler::new(config.scheduler.settings(), Arc::clone(&clock), spawner);
        let scheduler = match heartbeat_sink {
            Some(sink) => scheduler.with_heartbeat_sink(sink)?,
            None => scheduler,
        };

        let with_offset = |spec: JobSpec, offset: Option<u64>| match offset {
            Some(secs) => spec.with_offset(Duration::from_secs(secs)),
            None => spec,
        };
        scheduler.register(
            with_offset(
                JobSpec::new(JOB_QUEUE_PROCESSOR, Duration::from_secs(config.queue.interval_secs)),
                config.queue.start_offset_secs,
            )
            .sharing(RESOURCE_SESSION_POOL),
            Arc::clone(&processor) as Arc<dyn PeriodicTask>,
        )?;
        scheduler.register(
            with_offset(
                JobSpec::new(JOB_RECOVERY_SWEEPER, Duration::from_secs(config.recovery.interval_secs)),
                config.recovery.start_offset_secs,
            )
            .sharing(RESOURCE_SESSION_POOL),
            Arc::clone(&sweeper) as Arc<dyn PeriodicTask>,
        )?;
        scheduler.register(
            JobSpec::new(
                JOB_POOL_WATCHDOG,
                Duration::from_secs(config.scheduler.watchdog_interval_secs),
            )
            .sharing(RESOURCE_SESSION_POOL),
            Arc::new(PoolWatchdog::new(pool.clone())),
        )?;

        tracing::info!(
            capacity = config.pool.capacity,
            breakers = breakers.len(),
            rate_limits = rate_limiters.len(),
            "orchestrator assembled"
        );

        Ok(Orchestrator {
            config,
            clock,
            pool,
            store,
            breakers,
            rate_limiters,
            processor,
            sweeper,
            scheduler,
        })
    }
}

/// Fully wired orchestration layer.
pub struct Orchestrator<P, SP, S>
where
    P: WorkPayload,
    SP: SessionProvider,
{
    config: OrchestratorConfig,
    clock: SharedClock,
    pool: SessionPool<SP>,
    store: Arc<dyn WorkItemStore<P>>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    rate_limiters: BTreeMap<String, Arc<RateLimiter>>,
    processor: Arc<QueueProcessor<P, SP>>,
    sweeper: Arc<RecoverySweeper<P, SP::Session>>,
    scheduler: JobScheduler<S>,
}

impl<P, SP, S> Orchestrator<P, SP, S>
where
    P: WorkPayload,
    SP: SessionProvider,
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Start building from `config`.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Register a host job whose schedule comes from the `jobs` config section.
    ///
    /// Returns `false` when the job is configured but disabled.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::UnknownJob` if the job has no configuration
    /// - any error from [`JobScheduler::register`]
    pub fn register_job(&self, name: &str, task: Arc<dyn PeriodicTask>) -> Result<bool, SchedulerError> {
        let job = self
            .config
            .jobs
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        if !job.enabled {
            tracing::info!(job = name, "job disabled by configuration");
            return Ok(false);
        }
        let mut spec = JobSpec::new(name, Duration::from_secs(job.interval_secs));
        if let Some(secs) = job.start_offset_secs {
            spec = spec.with_offset(Duration::from_secs(secs));
        }
        if let Some(resource) = &job.resource {
            spec = spec.sharing(resource.clone());
        }
        self.scheduler.register(spec, task)?;
        Ok(true)
    }

    /// Arm every job timer.
    ///
    /// # Errors
    ///
    /// Returns an error if already started.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start()
    }

    /// Stop timers and shut the pool down.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.pool.shutdown();
    }

    /// Assemble the read-only status report.
    ///
    /// # Errors
    ///
    /// Returns storage errors from counting work items.
    pub async fn status(&self) -> Result<StatusReport, SchedulerError> {
        let work_items = self.store.counts().await?;
        Ok(StatusReport {
            generated_at_ms: self.clock.now_ms(),
            jobs: self.scheduler.descriptors(),
            stalled: self.scheduler.stalled_jobs(),
            breakers: self.breakers.values().map(|b| b.snapshot()).collect(),
            rate_limits: self.rate_limiters.values().map(|l| l.snapshot()).collect(),
            pool: self.pool.health(),
            queue: self.processor.stats(),
            work_items,
        })
    }

    /// Health derived from the current status.
    ///
    /// # Errors
    ///
    /// Returns storage errors from counting work items.
    pub async fn health(&self) -> Result<Health, SchedulerError> {
        Ok(api::health(&self.status().await?))
    }

    /// Loaded configuration.
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Session pool, for host jobs that need sessions.
    pub const fn pool(&self) -> &SessionPool<SP> {
        &self.pool
    }

    /// Work item store.
    pub fn store(&self) -> &Arc<dyn WorkItemStore<P>> {
        &self.store
    }

    /// Breaker for a failure domain.
    pub fn breaker(&self, name: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    /// Limiter for an action class.
    pub fn rate_limiter(&self, name: &str) -> Option<&Arc<RateLimiter>> {
        self.rate_limiters.get(name)
    }

    /// Queue processor.
    pub const fn processor(&self) -> &Arc<QueueProcessor<P, SP>> {
        &self.processor
    }

    /// Recovery sweeper.
    pub const fn sweeper(&self) -> &Arc<RecoverySweeper<P, SP::Session>> {
        &self.sweeper
    }

    /// Job scheduler.
    pub const fn scheduler(&self) -> &JobScheduler<S> {
        &self.scheduler
    }
}
