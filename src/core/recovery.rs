//! Recovery sweeper for items whose outcome was never observed.
//!
//! An item left `InProgress` past the stuck threshold is first marked
//! `Stuck` (conditionally, so a processor that finishes in the meantime wins).
//! The sweeper then asks the action collaborator whether the artifact exists:
//!
//! - found: `Stuck -> Done` with the discovered reference (phantom recovery)
//! - not found: `Stuck -> Queued` with one more attempt, or `Failed` once the
//!   attempt budget is spent
//! - verification error: the item stays `Stuck` and is retried next sweep

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::action::{Lookup, PublishAction, Verification, WorkPayload};
use crate::core::audit::{self, SharedAuditSink};
use crate::core::error::{ActionError, SchedulerError};
use crate::core::scheduler::PeriodicTask;
use crate::core::work_item::{StatusUpdate, UpdateOutcome, WorkItem, WorkItemStore, WorkStatus};
use crate::util::clock::{duration_ms, SharedClock};

const COMPONENT: &str = "recovery-sweeper";

/// Sweeper tuning.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Age of `last_attempt_at` after which an in-progress item is stuck.
    pub stuck_after: Duration,
    /// Items examined per sweep.
    pub batch_size: usize,
    /// Resolved failures after which an item is failed for good.
    pub max_attempts: u32,
    /// Bound on each verification call.
    pub verify_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(15 * 60),
            batch_size: 50,
            max_attempts: 3,
            verify_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Candidates looked at.
    pub examined: usize,
    /// In-progress items newly marked stuck.
    pub marked_stuck: usize,
    /// Items reconciled to done.
    pub recovered: usize,
    /// Items returned to the queue.
    pub requeued: usize,
    /// Items failed for good.
    pub failed: usize,
    /// Items left stuck because verification failed.
    pub unresolved: usize,
    /// Items resolved concurrently by someone else.
    pub conflicts: usize,
}

/// Periodically reconciles stuck work items.
pub struct RecoverySweeper<P, S>
where
    P: WorkPayload,
    S: Send + 'static,
{
    store: Arc<dyn WorkItemStore<P>>,
    action: Arc<dyn PublishAction<P, S>>,
    clock: SharedClock,
    audit: Option<SharedAuditSink>,
    config: SweeperConfig,
}

impl<P, S> RecoverySweeper<P, S>
where
    P: WorkPayload,
    S: Send + 'static,
{
    /// Wire a sweeper to its collaborators.
    pub fn new(
        config: SweeperConfig,
        store: Arc<dyn WorkItemStore<P>>,
        action: Arc<dyn PublishAction<P, S>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            action,
            clock,
            audit: None,
            config,
        }
    }

    /// Attach an audit sink for status transitions.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sweeper settings.
    pub const fn config(&self) -> &SweeperConfig {
        &self.config
    }

    fn audit(&self, item: &WorkItem<P>, action: &str, detail: Option<String>) {
        audit::record(self.audit.as_ref(), COMPONENT, item.id.to_string(), action, detail);
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Returns storage errors; items already handled keep their new status.
    pub async fn sweep(&self) -> Result<SweepSummary, SchedulerError> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(duration_ms(self.config.stuck_after));
        let candidates = self.store.fetch_stuck(cutoff, self.config.batch_size).await?;
        let mut summary = SweepSummary::default();

        for candidate in candidates {
            summary.examined += 1;
            let item = if candidate.status == WorkStatus::InProgress {
                let update = StatusUpdate::transition(WorkStatus::InProgress, WorkStatus::Stuck)
                    .with_error(format!("no outcome within {:?}", self.config.stuck_after));
                match self.store.update_status(candidate.id, update).await? {
                    UpdateOutcome::Applied(item) => {
                        tracing::warn!(item_id = item.id, "item stuck in progress, reconciling");
                        summary.marked_stuck += 1;
                        self.audit(&item, "stuck", None);
                        item
                    }
                    UpdateOutcome::Conflict(_) | UpdateOutcome::NotFound => {
                        summary.conflicts += 1;
                        continue;
                    }
                }
            } else {
                candidate
            };
            self.reconcile(&item, &mut summary).await?;
        }

        if summary.examined > 0 {
            tracing::info!(
                examined = summary.examined,
                recovered = summary.recovered,
                requeued = summary.requeued,
                failed = summary.failed,
                unresolved = summary.unresolved,
                "recovery sweep finished"
            );
        }
        Ok(summary)
    }

    fn lookup_for(&self, item: &WorkItem<P>) -> Option<Lookup> {
        item.external_ref
            .clone()
            .map(Lookup::ExternalRef)
            .or_else(|| self.action.search_key(&item.payload).map(Lookup::SearchKey))
    }

    async fn verify(&self, lookup: Option<&Lookup>) -> Result<Verification, ActionError> {
        let Some(lookup) = lookup else {
            return Ok(Verification::missing());
        };
        tokio::time::timeout(self.config.verify_timeout, self.action.verify(lookup))
            .await
            .unwrap_or(Err(ActionError::Timeout(self.config.verify_timeout)))
    }

    async fn reconcile(&self, item: &WorkItem<P>, summary: &mut SweepSummary) -> Result<(), SchedulerError> {
        let lookup = self.lookup_for(item);
        let verification = match self.verify(lookup.as_ref()).await {
            Ok(verification) => verification,
            Err(err) => {
                tracing::warn!(item_id = item.id, error = %err, "verification failed, item left stuck");
                summary.unresolved += 1;
                self.audit(item, "verify_failed", Some(err.to_string()));
                return Ok(());
            }
        };

        if verification.found {
            let external_ref = verification.external_ref.or_else(|| item.external_ref.clone());
            let update = StatusUpdate::transition(WorkStatus::Stuck, WorkStatus::Done)
                .with_external_ref(external_ref.clone());
            if self.store.update_status(item.id, update).await?.is_applied() {
                tracing::info!(
                    item_id = item.id,
                    external_ref = external_ref.as_deref().unwrap_or(""),
                    "phantom success reconciled"
                );
                summary.recovered += 1;
                self.audit(item, "recovered", external_ref);
            } else {
                summary.conflicts += 1;
            }
            return Ok(());
        }

        let attempts = item.attempts.saturating_add(1);
        let exhausted = attempts >= self.config.max_attempts;
        let next = if exhausted { WorkStatus::Failed } else { WorkStatus::Queued };
        let reason = if exhausted {
            format!("not found after {attempts} attempts")
        } else {
            "no trace of a completed action".to_string()
        };
        let update = StatusUpdate::transition(WorkStatus::Stuck, next)
            .bump_attempts()
            .with_error(reason.clone());
        if !self.store.update_status(item.id, update).await?.is_applied() {
            summary.conflicts += 1;
        } else if exhausted {
            tracing::error!(item_id = item.id, attempts, "stuck item failed, attempts exhausted");
            summary.failed += 1;
            self.audit(item, "failed", Some(reason));
        } else {
            tracing::info!(item_id = item.id, attempts, "stuck item re-queued");
            summary.requeued += 1;
            self.audit(item, "requeued", Some(reason));
        }
        Ok(())
    }
}

#[async_trait]
impl<P, S> PeriodicTask for RecoverySweeper<P, S>
where
    P: WorkPayload,
    S: Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        let summary = self.sweep().await?;
        if summary.unresolved > 0 {
            anyhow::bail!("{} stuck item(s) could not be verified", summary.unresolved);
        }
        Ok(())
    }
}
