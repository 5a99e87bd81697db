//! Staggered periodic job scheduler.
//!
//! Jobs live in an explicit registry of [`JobSpec`]s. When the scheduler
//! starts, jobs that share a scarce resource get distinct start offsets (see
//! [`stagger_offsets`]) so their first executions never coincide. Every
//! invocation runs inside a wrapper that:
//!
//! - catches errors and panics, logs them with the job name, and keeps the
//!   timer running;
//! - records a heartbeat (`last_run_at_ms`, `last_duration_ms`, `last_error`)
//!   on success and failure alike;
//! - skips a tick (recorded as a skip, not a failure) while the previous
//!   invocation of the same job is still running.
//!
//! A stall monitor reports jobs whose last run is older than
//! `interval * 1.5 + grace`. It only reports; it never restarts anything.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::error::SchedulerError;
use crate::util::clock::{duration_ms, SharedClock};

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Body of a periodic job.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Run one invocation. Errors are recorded against the job and never
    /// propagate to other jobs.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`PeriodicTask`].
pub struct FnTask<F>(pub F);

#[async_trait]
impl<F, Fut> PeriodicTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

/// Registration record for a periodic job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Unique job name.
    pub name: String,
    /// Time between invocations.
    pub interval: Duration,
    /// Explicit first-run offset; `None` lets the scheduler stagger it.
    pub start_offset: Option<Duration>,
    /// Scarce resource this job competes for, if any.
    pub resource: Option<String>,
}

impl JobSpec {
    /// Job with the given name and interval.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            start_offset: None,
            resource: None,
        }
    }

    /// Pin the first run to `offset` after start.
    #[must_use]
    pub const fn with_offset(mut self, offset: Duration) -> Self {
        self.start_offset = Some(offset);
        self
    }

    /// Declare the scarce resource this job shares with others.
    #[must_use]
    pub fn sharing(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The task returned `Ok`.
    Succeeded,
    /// The task returned an error.
    Failed(String),
    /// The task panicked.
    Panicked(String),
    /// The previous invocation was still running.
    Skipped,
}

/// Live state of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job name.
    pub name: String,
    /// Interval between invocations.
    pub interval: Duration,
    /// Assigned first-run offset.
    pub start_offset: Duration,
    /// Shared resource group.
    pub resource: Option<String>,
    /// Start time of the last completed invocation (ms since epoch).
    pub last_run_at_ms: Option<u128>,
    /// Duration of the last completed invocation.
    pub last_duration_ms: Option<u64>,
    /// Error of the last invocation, cleared on success.
    pub last_error: Option<String>,
    /// Completed invocations.
    pub runs: u64,
    /// Invocations that failed or panicked.
    pub failures: u64,
    /// Ticks skipped because the job was still running.
    pub skips: u64,
    /// Whether an invocation is in flight.
    pub running: bool,
}

/// Heartbeat emitted after every invocation or skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Job name.
    pub job: String,
    /// When the heartbeat was recorded (ms since epoch).
    pub recorded_at_ms: u128,
    /// Outcome of the invocation.
    pub outcome: JobOutcome,
    /// Start of the last completed invocation.
    pub last_run_at_ms: Option<u128>,
    /// Duration of the last completed invocation.
    pub last_duration_ms: Option<u64>,
    /// Last error, if any.
    pub last_error: Option<String>,
}

/// Mirror for heartbeats, for external observability.
pub trait HeartbeatSink: Send + Sync {
    /// Record a heartbeat.
    fn record(&self, heartbeat: &Heartbeat);
}

/// Liveness violation reported by the stall monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallReport {
    /// Job name.
    pub job: String,
    /// Last run start, if the job ever completed a run.
    pub last_run_at_ms: Option<u128>,
    /// How far past the stall threshold the job is.
    pub overdue_ms: u128,
    /// Whether an invocation is currently in flight (likely hung).
    pub running: bool,
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Minimum distance between first runs of jobs sharing a resource.
    pub min_spacing: Duration,
    /// Grace added to `interval * 1.5` before a job counts as stalled.
    pub stall_grace: Duration,
    /// How often the stall monitor runs; `None` disables it.
    pub stall_check_interval: Option<Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(30),
            stall_grace: Duration::from_secs(60),
            stall_check_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Assign first-run offsets.
///
/// Jobs with an explicit offset keep it. Within each resource group the
/// remaining jobs get `index * (interval / group_size)`, pushed forward so that
/// no two offsets in the group are closer than `min_spacing`. Jobs without a
/// resource group start at zero unless pinned.
pub fn stagger_offsets(specs: &[JobSpec], min_spacing: Duration) -> Vec<Duration> {
    let mut offsets: Vec<Duration> = specs
        .iter()
        .map(|s| s.start_offset.unwrap_or(Duration::ZERO))
        .collect();

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, spec) in specs.iter().enumerate() {
        if let Some(resource) = spec.resource.as_deref() {
            groups.entry(resource).or_default().push(i);
        }
    }

    for (resource, members) in groups {
        let size = u32::try_from(members.len()).unwrap_or(u32::MAX);
        let mut taken: Vec<Duration> = members
            .iter()
            .filter_map(|&i| specs[i].start_offset)
            .collect();
        let mut previous: Option<Duration> = None;
        for (position, &i) in members.iter().enumerate() {
            if specs[i].start_offset.is_some() {
                continue;
            }
            let position = u32::try_from(position).unwrap_or(u32::MAX);
            let mut candidate = (specs[i].interval / size).saturating_mul(position);
            if let Some(prev) = previous {
                candidate = candidate.max(prev.saturating_add(min_spacing));
            }
            while let Some(clash) = taken
                .iter()
                .copied()
                .find(|t| t.abs_diff(candidate) < min_spacing)
            {
                candidate = clash.saturating_add(min_spacing);
            }
            tracing::debug!(
                job = %specs[i].name,
                resource,
                offset_secs = candidate.as_secs(),
                "assigned start offset"
            );
            offsets[i] = candidate;
            taken.push(candidate);
            previous = Some(candidate);
        }
    }
    offsets
}

struct JobEntry {
    spec: JobSpec,
    task: Arc<dyn PeriodicTask>,
    running: AtomicBool,
    descriptor: Mutex<JobDescriptor>,
}

struct SchedulerInner {
    settings: SchedulerSettings,
    clock: SharedClock,
    heartbeat_sink: Option<Arc<dyn HeartbeatSink>>,
    jobs: RwLock<Vec<Arc<JobEntry>>>,
    started_at_ms: Mutex<Option<u128>>,
    stalled: Mutex<Vec<StallReport>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerInner {
    fn emit(&self, entry: &JobEntry, outcome: JobOutcome) {
        let Some(sink) = self.heartbeat_sink.as_ref() else {
            return;
        };
        let heartbeat = {
            let d = entry.descriptor.lock();
            Heartbeat {
                job: d.name.clone(),
                recorded_at_ms: self.clock.now_ms(),
                outcome,
                last_run_at_ms: d.last_run_at_ms,
                last_duration_ms: d.last_duration_ms,
                last_error: d.last_error.clone(),
            }
        };
        sink.record(&heartbeat);
    }

    fn record_skip(&self, entry: &JobEntry) {
        let skips = {
            let mut d = entry.descriptor.lock();
            d.skips += 1;
            d.skips
        };
        tracing::debug!(job = %entry.spec.name, skips, "previous run still in progress, tick skipped");
        self.emit(entry, JobOutcome::Skipped);
    }

    /// Run one invocation inside the failure-isolating wrapper.
    async fn invoke(&self, entry: &JobEntry) -> JobOutcome {
        let started_ms = self.clock.now_ms();
        let started = Instant::now();
        entry.descriptor.lock().running = true;

        let result = AssertUnwindSafe(entry.task.run()).catch_unwind().await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(err)) => JobOutcome::Failed(format!("{err:#}")),
            Err(panic) => JobOutcome::Panicked(panic_message(panic.as_ref())),
        };

        {
            let mut d = entry.descriptor.lock();
            d.last_run_at_ms = Some(started_ms);
            d.last_duration_ms = Some(elapsed_ms);
            d.runs += 1;
            d.running = false;
            match &outcome {
                JobOutcome::Succeeded => d.last_error = None,
                JobOutcome::Failed(reason) | JobOutcome::Panicked(reason) => {
                    d.failures += 1;
                    d.last_error = Some(reason.clone());
                }
                JobOutcome::Skipped => {}
            }
        }

        match &outcome {
            JobOutcome::Succeeded => {
                tracing::debug!(job = %entry.spec.name, duration_ms = elapsed_ms, "job finished");
            }
            JobOutcome::Failed(reason) => {
                tracing::error!(job = %entry.spec.name, duration_ms = elapsed_ms, error = %reason, "job failed");
            }
            JobOutcome::Panicked(reason) => {
                tracing::error!(job = %entry.spec.name, duration_ms = elapsed_ms, panic = %reason, "job panicked");
            }
            JobOutcome::Skipped => {}
        }

        entry.running.store(false, Ordering::Release);
        self.emit(entry, outcome.clone());
        outcome
    }

    fn stalled_at(&self, now_ms: u128) -> Vec<StallReport> {
        let Some(started_at) = *self.started_at_ms.lock() else {
            return Vec::new();
        };
        let grace = duration_ms(self.settings.stall_grace);
        self.jobs
            .read()
            .iter()
            .filter_map(|entry| {
                let d = entry.descriptor.lock();
                let reference = d
                    .last_run_at_ms
                    .unwrap_or_else(|| started_at + duration_ms(d.start_offset));
                let threshold = duration_ms(d.interval) * 3 / 2 + grace;
                let deadline = reference.saturating_add(threshold);
                (now_ms > deadline).then(|| StallReport {
                    job: d.name.clone(),
                    last_run_at_ms: d.last_run_at_ms,
                    overdue_ms: now_ms - deadline,
                    running: d.running,
                })
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registry and timer set for periodic jobs.
pub struct JobScheduler<S> {
    inner: Arc<SchedulerInner>,
    spawner: S,
    started: AtomicBool,
}

impl<S> JobScheduler<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Create an empty scheduler.
    pub fn new(settings: SchedulerSettings, clock: SharedClock, spawner: S) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                clock,
                heartbeat_sink: None,
                jobs: RwLock::new(Vec::new()),
                started_at_ms: Mutex::new(None),
                stalled: Mutex::new(Vec::new()),
                shutdown_tx,
            }),
            spawner,
            started: AtomicBool::new(false),
        }
    }

    /// Mirror heartbeats to `sink`. Must be called before jobs are registered.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` once the registry is shared.
    pub fn with_heartbeat_sink(mut self, sink: Arc<dyn HeartbeatSink>) -> Result<Self, SchedulerError> {
        let inner = Arc::get_mut(&mut self.inner).ok_or_else(|| {
            SchedulerError::InvalidConfig("heartbeat sink must be set before start".into())
        })?;
        inner.heartbeat_sink = Some(sink);
        Ok(self)
    }

    /// Register a periodic job.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::DuplicateJob` if the name is taken
    /// - `SchedulerError::InvalidConfig` for a zero interval or after start
    pub fn register(&self, spec: JobSpec, task: Arc<dyn PeriodicTask>) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::Acquire) {
            return Err(SchedulerError::InvalidConfig(format!(
                "cannot register `{}` after the scheduler started",
                spec.name
            )));
        }
        if spec.interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(format!(
                "job `{}` has a zero interval",
                spec.name
            )));
        }
        let mut jobs = self.inner.jobs.write();
        if jobs.iter().any(|j| j.spec.name == spec.name) {
            return Err(SchedulerError::DuplicateJob(spec.name));
        }
        let descriptor = JobDescriptor {
            name: spec.name.clone(),
            interval: spec.interval,
            start_offset: spec.start_offset.unwrap_or(Duration::ZERO),
            resource: spec.resource.clone(),
            last_run_at_ms: None,
            last_duration_ms: None,
            last_error: None,
            runs: 0,
            failures: 0,
            skips: 0,
            running: false,
        };
        tracing::info!(job = %spec.name, interval_secs = spec.interval.as_secs(), "job registered");
        jobs.push(Arc::new(JobEntry {
            spec,
            task,
            running: AtomicBool::new(false),
            descriptor: Mutex::new(descriptor),
        }));
        Ok(())
    }

    /// Register an async closure as a periodic job.
    ///
    /// # Errors
    ///
    /// Same as [`JobScheduler::register`].
    pub fn register_fn<F, Fut>(&self, spec: JobSpec, f: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(spec, Arc::new(FnTask(f)))
    }

    /// Assign offsets and arm every job's timer.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` if already started.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::InvalidConfig("scheduler already started".into()));
        }
        *self.inner.started_at_ms.lock() = Some(self.inner.clock.now_ms());

        let entries: Vec<Arc<JobEntry>> = self.inner.jobs.read().clone();
        let specs: Vec<JobSpec> = entries.iter().map(|e| e.spec.clone()).collect();
        let offsets = stagger_offsets(&specs, self.inner.settings.min_spacing);
        warn_on_pinned_collisions(&specs, &offsets);

        let base = Instant::now();
        for (entry, offset) in entries.into_iter().zip(offsets) {
            entry.descriptor.lock().start_offset = offset;
            let inner = Arc::clone(&self.inner);
            let spawner = self.spawner.clone();
            let shutdown = self.inner.shutdown_tx.subscribe();
            self.spawner
                .spawn(job_loop(inner, entry, base + offset, spawner, shutdown));
        }

        if let Some(every) = self.inner.settings.stall_check_interval {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.inner.shutdown_tx.subscribe();
            self.spawner.spawn(stall_monitor(inner, every, shutdown));
        }
        tracing::info!(jobs = specs.len(), "scheduler started");
        Ok(())
    }

    /// Run a job once, right now, through the same wrapper as timed runs.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnknownJob` if no such job is registered.
    pub async fn run_now(&self, name: &str) -> Result<JobOutcome, SchedulerError> {
        let entry = self
            .inner
            .jobs
            .read()
            .iter()
            .find(|e| e.spec.name == name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        if entry.running.swap(true, Ordering::AcqRel) {
            self.inner.record_skip(&entry);
            return Ok(JobOutcome::Skipped);
        }
        Ok(self.inner.invoke(&entry).await)
    }

    /// Stop all timers. In-flight invocations run to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        tracing::info!("scheduler shutdown requested");
    }

    /// Snapshot of every job's descriptor, in registration order.
    pub fn descriptors(&self) -> Vec<JobDescriptor> {
        self.inner
            .jobs
            .read()
            .iter()
            .map(|e| e.descriptor.lock().clone())
            .collect()
    }

    /// Descriptor for one job.
    pub fn descriptor(&self, name: &str) -> Option<JobDescriptor> {
        self.inner
            .jobs
            .read()
            .iter()
            .find(|e| e.spec.name == name)
            .map(|e| e.descriptor.lock().clone())
    }

    /// Jobs whose last run is older than `interval * 1.5 + grace` at `now_ms`.
    pub fn stalled_jobs_at(&self, now_ms: u128) -> Vec<StallReport> {
        self.inner.stalled_at(now_ms)
    }

    /// Jobs stalled right now.
    pub fn stalled_jobs(&self) -> Vec<StallReport> {
        self.inner.stalled_at(self.inner.clock.now_ms())
    }

    /// Result of the stall monitor's most recent pass.
    pub fn last_stall_reports(&self) -> Vec<StallReport> {
        self.inner.stalled.lock().clone()
    }
}

fn warn_on_pinned_collisions(specs: &[JobSpec], offsets: &[Duration]) {
    let mut seen: HashSet<(&str, Duration)> = HashSet::new();
    for (spec, offset) in specs.iter().zip(offsets) {
        if let Some(resource) = spec.resource.as_deref() {
            if !seen.insert((resource, *offset)) {
                tracing::warn!(job = %spec.name, resource, "pinned start offset collides with another job");
            }
        }
    }
}

async fn job_loop<S>(
    inner: Arc<SchedulerInner>,
    entry: Arc<JobEntry>,
    first_run: Instant,
    spawner: S,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(first_run, entry.spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        if entry.running.swap(true, Ordering::AcqRel) {
            inner.record_skip(&entry);
            continue;
        }
        let inner = Arc::clone(&inner);
        let entry = Arc::clone(&entry);
        spawner.spawn(async move {
            inner.invoke(&entry).await;
        });
    }
    tracing::debug!(job = %entry.spec.name, "job timer stopped");
}

async fn stall_monitor(inner: Arc<SchedulerInner>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let reports = inner.stalled_at(inner.clock.now_ms());
        for report in &reports {
            tracing::error!(
                job = %report.job,
                overdue_ms = u64::try_from(report.overdue_ms).unwrap_or(u64::MAX),
                running = report.running,
                "job stalled: liveness violation"
            );
        }
        *inner.stalled.lock() = reports;
    }
}
