//! Work item model and the conditional-update storage contract.
//!
//! Status changes are compare-and-swap: an update names the status it expects
//! the record to be in and is applied only if that still holds and the move is
//! a legal transition. This is what keeps the queue processor and the
//! recovery sweeper from both resolving the same item.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::SchedulerError;
use crate::util::serde::WorkItemId;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting for `scheduled_at`.
    Queued,
    /// Picked up; the external action may be running.
    InProgress,
    /// Completed externally.
    Done,
    /// Permanently failed.
    Failed,
    /// In progress for too long; awaiting reconciliation.
    Stuck,
}

impl WorkStatus {
    /// Done and Failed are never left.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use WorkStatus::{Done, Failed, InProgress, Queued, Stuck};
        matches!(
            (self, next),
            (Queued, InProgress)
                | (InProgress, Done | Failed | Queued | Stuck)
                | (Stuck, Queued | Done | Failed)
        )
    }
}

/// Unit of externally visible work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem<P> {
    /// Item identifier.
    pub id: WorkItemId,
    /// Domain payload handed to the action.
    pub payload: P,
    /// Current status.
    pub status: WorkStatus,
    /// Earliest time the item may be processed (ms since epoch).
    pub scheduled_at_ms: u128,
    /// Resolved failed attempts.
    pub attempts: u32,
    /// When the item was last picked up.
    pub last_attempt_at_ms: Option<u128>,
    /// Identifier of the externally created artifact, once known.
    pub external_ref: Option<String>,
    /// Last caught failure.
    pub last_error: Option<String>,
}

impl<P> WorkItem<P> {
    /// New queued item.
    pub const fn new(id: WorkItemId, payload: P, scheduled_at_ms: u128) -> Self {
        Self {
            id,
            payload,
            status: WorkStatus::Queued,
            scheduled_at_ms,
            attempts: 0,
            last_attempt_at_ms: None,
            external_ref: None,
            last_error: None,
        }
    }
}

/// Conditional status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Status the record must currently have.
    pub expected: WorkStatus,
    /// Status to move to.
    pub next: WorkStatus,
    /// Increment `attempts`.
    pub bump_attempts: bool,
    /// New `last_attempt_at_ms`.
    pub attempt_at_ms: Option<u128>,
    /// New `external_ref`.
    pub external_ref: Option<String>,
    /// New `last_error`.
    pub error: Option<String>,
    /// New `scheduled_at_ms`.
    pub reschedule_at_ms: Option<u128>,
}

impl StatusUpdate {
    /// Update from `expected` to `next` with no field changes.
    pub const fn transition(expected: WorkStatus, next: WorkStatus) -> Self {
        Self {
            expected,
            next,
            bump_attempts: false,
            attempt_at_ms: None,
            external_ref: None,
            error: None,
            reschedule_at_ms: None,
        }
    }

    /// Record a pickup time.
    #[must_use]
    pub const fn attempted_at(mut self, at_ms: u128) -> Self {
        self.attempt_at_ms = Some(at_ms);
        self
    }

    /// Count one more failed attempt.
    #[must_use]
    pub const fn bump_attempts(mut self) -> Self {
        self.bump_attempts = true;
        self
    }

    /// Store the external reference.
    #[must_use]
    pub fn with_external_ref(mut self, external_ref: Option<String>) -> Self {
        self.external_ref = external_ref;
        self
    }

    /// Store an error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Move `scheduled_at_ms`.
    #[must_use]
    pub const fn reschedule(mut self, at_ms: u128) -> Self {
        self.reschedule_at_ms = Some(at_ms);
        self
    }

    /// Apply to `item` if the expected status matches and the transition is
    /// legal. On refusal, returns the status the item actually has.
    ///
    /// # Errors
    ///
    /// Returns the current status when the update does not apply.
    pub fn apply_to<P>(&self, item: &mut WorkItem<P>) -> Result<(), WorkStatus> {
        if item.status != self.expected || !self.expected.can_transition_to(self.next) {
            return Err(item.status);
        }
        item.status = self.next;
        if self.bump_attempts {
            item.attempts = item.attempts.saturating_add(1);
        }
        if let Some(at) = self.attempt_at_ms {
            item.last_attempt_at_ms = Some(at);
        }
        if self.external_ref.is_some() {
            item.external_ref.clone_from(&self.external_ref);
        }
        if self.error.is_some() {
            item.last_error.clone_from(&self.error);
        }
        if let Some(at) = self.reschedule_at_ms {
            item.scheduled_at_ms = at;
        }
        Ok(())
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome<P> {
    /// The update was applied; carries the new record.
    Applied(WorkItem<P>),
    /// The record was not in the expected state.
    Conflict(WorkStatus),
    /// No such item.
    NotFound,
}

impl<P> UpdateOutcome<P> {
    /// Whether the update took effect.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Per-status totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Queued items.
    pub queued: usize,
    /// In-progress items.
    pub in_progress: usize,
    /// Done items.
    pub done: usize,
    /// Failed items.
    pub failed: usize,
    /// Stuck items.
    pub stuck: usize,
}

impl StatusCounts {
    /// Count one item in `status`.
    pub const fn add(&mut self, status: WorkStatus) {
        match status {
            WorkStatus::Queued => self.queued += 1,
            WorkStatus::InProgress => self.in_progress += 1,
            WorkStatus::Done => self.done += 1,
            WorkStatus::Failed => self.failed += 1,
            WorkStatus::Stuck => self.stuck += 1,
        }
    }
}

/// Storage collaborator for work items.
#[async_trait]
pub trait WorkItemStore<P>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
{
    /// Add a new item. Ids must be unique.
    async fn insert(&self, item: WorkItem<P>) -> Result<(), SchedulerError>;

    /// Look up one item.
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem<P>>, SchedulerError>;

    /// Queued items with `scheduled_at_ms <= now_ms`, oldest schedule first.
    async fn fetch_ready(&self, now_ms: u128, limit: usize) -> Result<Vec<WorkItem<P>>, SchedulerError>;

    /// Apply a conditional status update.
    async fn update_status(
        &self,
        id: WorkItemId,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome<P>, SchedulerError>;

    /// In-progress items last picked up at or before `cutoff_ms`, plus every
    /// item already marked stuck.
    async fn fetch_stuck(&self, cutoff_ms: u128, limit: usize) -> Result<Vec<WorkItem<P>>, SchedulerError>;

    /// Totals per status.
    async fn counts(&self) -> Result<StatusCounts, SchedulerError>;
}
