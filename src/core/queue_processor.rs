//! Queue processor: drives work items through the publish state machine.
//!
//! Each tick checks the circuit breaker and then the rate limiter, fetches
//! the oldest ready item, and marks it `InProgress` before touching the
//! external surface. After that it leases a session at publish priority and
//! performs the action under its own timeout. The lease is released on every
//! path because [`SessionLease`](crate::core::session_pool::SessionLease)
//! releases on drop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::action::{ActionReceipt, PublishAction, WorkPayload};
use crate::core::audit::{self, SharedAuditSink};
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::error::{ActionError, PoolError, SchedulerError};
use crate::core::rate_limiter::{Admission, RateLimiter};
use crate::core::scheduler::PeriodicTask;
use crate::core::session_pool::{SessionPool, SessionProvider};
use crate::core::work_item::{StatusUpdate, UpdateOutcome, WorkItem, WorkItemStore, WorkStatus};
use crate::util::clock::{duration_ms, SharedClock};
use crate::util::serde::{Priority, WorkItemId};

const COMPONENT: &str = "queue-processor";

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Items attempted per tick at most.
    pub batch_size: usize,
    /// Pool priority for publish work.
    pub priority: Priority,
    /// Bound on the pool wait.
    pub acquire_timeout: Duration,
    /// Bound on the external action.
    pub action_timeout: Duration,
    /// Resolved failures after which an item is failed for good.
    pub max_attempts: u32,
    /// Base delay before a failed item is eligible again.
    pub retry_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            priority: Priority::PUBLISH,
            acquire_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(300),
        }
    }
}

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    /// Items moved to `InProgress`.
    pub attempted: usize,
    /// Items completed.
    pub done: usize,
    /// Items failed for good.
    pub failed: usize,
    /// Items returned to the queue for a later attempt.
    pub requeued: usize,
    /// Items returned to the queue because the pool was exhausted.
    pub overloaded: usize,
    /// Items lost to a concurrent transition.
    pub conflicts: usize,
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Breaker open; nothing attempted.
    CircuitOpen,
    /// Rate limit reached; nothing attempted.
    RateLimited,
    /// No item was ready.
    Idle,
    /// At least one item was picked up.
    Processed(TickSummary),
}

/// Cumulative processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    /// Ticks run.
    pub ticks: u64,
    /// Ticks skipped by the breaker.
    pub circuit_skips: u64,
    /// Ticks skipped by the rate limiter.
    pub rate_limited: u64,
    /// Ticks with nothing ready.
    pub idle: u64,
    /// Items moved to `InProgress`.
    pub attempted: u64,
    /// Items completed.
    pub done: u64,
    /// Items failed for good.
    pub failed: u64,
    /// Items re-queued after a failure.
    pub requeued: u64,
    /// Items skipped due to pool overload.
    pub overloaded: u64,
    /// Lost CAS races.
    pub conflicts: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// Consumes ready work items.
pub struct QueueProcessor<P, SP>
where
    P: WorkPayload,
    SP: SessionProvider,
{
    pool: SessionPool<SP>,
    store: Arc<dyn WorkItemStore<P>>,
    action: Arc<dyn PublishAction<P, SP::Session>>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    clock: SharedClock,
    audit: Option<SharedAuditSink>,
    config: ProcessorConfig,
    stats: Mutex<ProcessorStats>,
}

impl<P, SP> QueueProcessor<P, SP>
where
    P: WorkPayload,
    SP: SessionProvider,
{
    /// Wire a processor to its collaborators.
    pub fn new(
        config: ProcessorConfig,
        pool: SessionPool<SP>,
        store: Arc<dyn WorkItemStore<P>>,
        action: Arc<dyn PublishAction<P, SP::Session>>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            pool,
            store,
            action,
            breaker,
            limiter,
            clock,
            audit: None,
            config,
            stats: Mutex::new(ProcessorStats::default()),
        }
    }

    /// Attach an audit sink for status transitions.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Processor settings.
    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Cumulative counters.
    pub fn stats(&self) -> ProcessorStats {
        *self.stats.lock()
    }

    fn audit(&self, id: WorkItemId, action: &str, detail: Option<String>) {
        audit::record(self.audit.as_ref(), COMPONENT, id.to_string(), action, detail);
    }

    /// Run one processing pass.
    ///
    /// # Errors
    ///
    /// Returns storage errors. An item caught mid-flight by a storage error
    /// stays `InProgress` and is later resolved by the recovery sweeper.
    pub async fn tick(&self) -> Result<TickOutcome, SchedulerError> {
        let mut summary = TickSummary::default();
        let mut first_gate: Option<TickOutcome> = None;

        for _ in 0..self.config.batch_size.max(1) {
            if !self.breaker.allow() {
                first_gate = Some(TickOutcome::CircuitOpen);
                break;
            }
            let Some(admission) = self.limiter.admit() else {
                self.breaker.abandon_probe();
                first_gate = Some(TickOutcome::RateLimited);
                break;
            };
            let ready = match self.store.fetch_ready(self.clock.now_ms(), 1).await {
                Ok(ready) => ready,
                Err(err) => {
                    self.give_back(admission);
                    return Err(err);
                }
            };
            let Some(item) = ready.into_iter().next() else {
                self.give_back(admission);
                first_gate = Some(TickOutcome::Idle);
                break;
            };
            match self.process(item, admission, &mut summary).await? {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }

        let outcome = match first_gate {
            Some(gate) if summary == TickSummary::default() => gate,
            _ => TickOutcome::Processed(summary),
        };

        let mut stats = self.stats.lock();
        stats.ticks += 1;
        match outcome {
            TickOutcome::CircuitOpen => stats.circuit_skips += 1,
            TickOutcome::RateLimited => stats.rate_limited += 1,
            TickOutcome::Idle => stats.idle += 1,
            TickOutcome::Processed(s) => {
                stats.attempted += s.attempted as u64;
                stats.done += s.done as u64;
                stats.failed += s.failed as u64;
                stats.requeued += s.requeued as u64;
                stats.overloaded += s.overloaded as u64;
                stats.conflicts += s.conflicts as u64;
            }
        }
        drop(stats);
        Ok(outcome)
    }

    /// Return the rate admission and any half-open probe when no action ran.
    fn give_back(&self, admission: Admission) {
        self.limiter.refund(admission);
        self.breaker.abandon_probe();
    }

    async fn process(
        &self,
        item: WorkItem<P>,
        admission: Admission,
        summary: &mut TickSummary,
    ) -> Result<Flow, SchedulerError> {
        let id = item.id;
        let picked_up = StatusUpdate::transition(WorkStatus::Queued, WorkStatus::InProgress)
            .attempted_at(self.clock.now_ms());
        let item = match self.store.update_status(id, picked_up).await? {
            UpdateOutcome::Applied(item) => item,
            UpdateOutcome::Conflict(actual) => {
                tracing::debug!(item_id = id, status = ?actual, "item taken by another worker");
                self.give_back(admission);
                summary.conflicts += 1;
                return Ok(Flow::Continue);
            }
            UpdateOutcome::NotFound => {
                self.give_back(admission);
                summary.conflicts += 1;
                return Ok(Flow::Continue);
            }
        };
        summary.attempted += 1;
        self.audit(id, "in_progress", None);

        let mut lease = match self
            .pool
            .acquire(self.config.priority, self.config.acquire_timeout)
            .await
        {
            Ok(lease) => lease,
            Err(PoolError::Timeout(waited)) => {
                self.give_back(admission);
                let reason = format!("pool overloaded, no session within {waited:?}");
                tracing::warn!(item_id = id, "{reason}");
                let update = StatusUpdate::transition(WorkStatus::InProgress, WorkStatus::Queued)
                    .with_error(reason.clone());
                if self.store.update_status(id, update).await?.is_applied() {
                    summary.overloaded += 1;
                    self.audit(id, "overloaded", Some(reason));
                } else {
                    summary.conflicts += 1;
                }
                return Ok(Flow::Stop);
            }
            Err(PoolError::SessionCreation(reason)) => {
                self.limiter.refund(admission);
                self.breaker.record_failure(reason.clone());
                let error = ActionError::Transient(format!("session creation failed: {reason}"));
                self.resolve_failure(&item, &error, summary).await?;
                return Ok(Flow::Continue);
            }
            Err(PoolError::Shutdown) => {
                self.give_back(admission);
                let update = StatusUpdate::transition(WorkStatus::InProgress, WorkStatus::Queued)
                    .with_error("session pool shut down");
                if !self.store.update_status(id, update).await?.is_applied() {
                    summary.conflicts += 1;
                }
                return Ok(Flow::Stop);
            }
        };

        let session_id = lease.id();
        tracing::debug!(item_id = id, session_id, "performing action");
        let performed = tokio::time::timeout(
            self.config.action_timeout,
            self.action.perform(&item.payload, lease.session_mut()),
        )
        .await
        .unwrap_or(Err(ActionError::Timeout(self.config.action_timeout)));
        if matches!(performed, Err(ActionError::Timeout(_))) {
            lease.mark_broken();
        }
        drop(lease);

        match performed {
            Ok(receipt) => {
                self.breaker.record_success();
                self.complete(&item, receipt, summary).await?;
            }
            Err(error) => {
                if error.counts_against_breaker() {
                    self.breaker.record_failure(error.to_string());
                } else {
                    // The surface answered; only the content was refused.
                    self.breaker.record_success();
                }
                tracing::warn!(item_id = id, session_id, error = %error, "action failed");
                self.resolve_failure(&item, &error, summary).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Apply `build(from)` from `InProgress`, falling back to `Stuck` when the
    /// sweeper flagged the item while the action was running.
    async fn settle(
        &self,
        id: WorkItemId,
        build: impl Fn(WorkStatus) -> StatusUpdate + Send,
    ) -> Result<UpdateOutcome<P>, SchedulerError> {
        match self.store.update_status(id, build(WorkStatus::InProgress)).await? {
            UpdateOutcome::Conflict(WorkStatus::Stuck) => {
                self.store.update_status(id, build(WorkStatus::Stuck)).await
            }
            other => Ok(other),
        }
    }

    async fn complete(
        &self,
        item: &WorkItem<P>,
        receipt: ActionReceipt,
        summary: &mut TickSummary,
    ) -> Result<(), SchedulerError> {
        let external_ref = receipt.external_ref;
        let outcome = self
            .settle(item.id, |from| {
                StatusUpdate::transition(from, WorkStatus::Done).with_external_ref(external_ref.clone())
            })
            .await?;
        let recorded = match outcome {
            UpdateOutcome::Applied(_) => true,
            UpdateOutcome::Conflict(WorkStatus::Queued) => {
                tracing::warn!(item_id = item.id, "item was requeued while its action ran");
                self.reclaim_done(item.id, external_ref.as_deref()).await?
            }
            UpdateOutcome::Conflict(actual) => {
                tracing::warn!(item_id = item.id, status = ?actual, "item resolved elsewhere before completion was recorded");
                false
            }
            UpdateOutcome::NotFound => false,
        };
        if recorded {
            tracing::info!(item_id = item.id, external_ref = external_ref.as_deref().unwrap_or(""), "item done");
            summary.done += 1;
            self.audit(item.id, "done", external_ref);
        } else {
            summary.conflicts += 1;
            self.audit(item.id, "completion_lost", external_ref);
        }
        Ok(())
    }

    /// Record a completion for an item the sweeper put back in the queue
    /// while its action was still running.
    ///
    /// The item is claimed first so no other tick can pick it up, then
    /// completed with the reference the action returned.
    async fn reclaim_done(&self, id: WorkItemId, external_ref: Option<&str>) -> Result<bool, SchedulerError> {
        let claim = StatusUpdate::transition(WorkStatus::Queued, WorkStatus::InProgress).attempted_at(self.clock.now_ms());
        if !self.store.update_status(id, claim).await?.is_applied() {
            return Ok(false);
        }
        let outcome = self
            .settle(id, |from| {
                StatusUpdate::transition(from, WorkStatus::Done).with_external_ref(external_ref.map(str::to_string))
            })
            .await?;
        Ok(outcome.is_applied())
    }

    async fn resolve_failure(
        &self,
        item: &WorkItem<P>,
        error: &ActionError,
        summary: &mut TickSummary,
    ) -> Result<(), SchedulerError> {
        let attempts = item.attempts.saturating_add(1);
        let retry = error.is_retryable() && attempts < self.config.max_attempts;
        let reason = error.to_string();
        let retry_at = self.clock.now_ms() + duration_ms(self.config.retry_backoff) * u128::from(attempts);

        let outcome = self
            .settle(item.id, |from| {
                let update = if retry {
                    StatusUpdate::transition(from, WorkStatus::Queued).reschedule(retry_at)
                } else {
                    StatusUpdate::transition(from, WorkStatus::Failed)
                };
                update.bump_attempts().with_error(reason.clone())
            })
            .await?;

        match outcome {
            UpdateOutcome::Applied(_) if retry => {
                summary.requeued += 1;
                self.audit(item.id, "requeued", Some(reason));
            }
            UpdateOutcome::Applied(_) => {
                tracing::error!(item_id = item.id, attempts, error = %reason, "item failed");
                summary.failed += 1;
                self.audit(item.id, "failed", Some(reason));
            }
            UpdateOutcome::Conflict(_) | UpdateOutcome::NotFound => summary.conflicts += 1,
        }
        Ok(())
    }
}

#[async_trait]
impl<P, SP> PeriodicTask for QueueProcessor<P, SP>
where
    P: WorkPayload,
    SP: SessionProvider,
{
    async fn run(&self) -> anyhow::Result<()> {
        let outcome = self.tick().await?;
        match outcome {
            TickOutcome::CircuitOpen => tracing::debug!("circuit open, tick skipped"),
            TickOutcome::RateLimited => tracing::debug!("rate limit reached, tick skipped"),
            TickOutcome::Idle => tracing::trace!("no ready items"),
            TickOutcome::Processed(summary) => tracing::info!(
                attempted = summary.attempted,
                done = summary.done,
                failed = summary.failed,
                requeued = summary.requeued,
                overloaded = summary.overloaded,
                "queue tick processed"
            ),
        }
        Ok(())
    }
}
