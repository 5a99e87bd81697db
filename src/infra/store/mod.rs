//! Work item store backends.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlWorkItemStore;
pub use memory::InMemoryWorkItemStore;

use std::collections::BTreeMap;

use crate::core::{SchedulerError, StatusCounts, StatusUpdate, UpdateOutcome, WorkItem, WorkStatus};
use crate::util::serde::WorkItemId;

/// Item table shared by the store backends. Callers hold the lock.
pub(crate) struct ItemTable<P> {
    items: BTreeMap<WorkItemId, WorkItem<P>>,
}

impl<P: Clone> ItemTable<P> {
    pub(crate) const fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, item: WorkItem<P>) -> Result<(), SchedulerError> {
        if self.items.contains_key(&item.id) {
            return Err(SchedulerError::Storage(format!("work item {} already exists", item.id)));
        }
        self.items.insert(item.id, item);
        Ok(())
    }

    pub(crate) fn contains(&self, id: WorkItemId) -> bool {
        self.items.contains_key(&id)
    }

    /// Insert or overwrite, used when replaying a journal.
    pub(crate) fn put(&mut self, item: WorkItem<P>) {
        self.items.insert(item.id, item);
    }

    pub(crate) fn get(&self, id: WorkItemId) -> Option<WorkItem<P>> {
        self.items.get(&id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<WorkItem<P>> {
        self.items.values().cloned().collect()
    }

    pub(crate) fn fetch_ready(&self, now_ms: u128, limit: usize) -> Vec<WorkItem<P>> {
        let mut ready: Vec<&WorkItem<P>> = self
            .items
            .values()
            .filter(|i| i.status == WorkStatus::Queued && i.scheduled_at_ms <= now_ms)
            .collect();
        ready.sort_by_key(|i| (i.scheduled_at_ms, i.id));
        ready.into_iter().take(limit).cloned().collect()
    }

    pub(crate) fn fetch_stuck(&self, cutoff_ms: u128, limit: usize) -> Vec<WorkItem<P>> {
        let mut stuck: Vec<&WorkItem<P>> = self
            .items
            .values()
            .filter(|i| match i.status {
                WorkStatus::Stuck => true,
                WorkStatus::InProgress => i.last_attempt_at_ms.is_none_or(|at| at <= cutoff_ms),
                _ => false,
            })
            .collect();
        stuck.sort_by_key(|i| (i.last_attempt_at_ms, i.id));
        stuck.into_iter().take(limit).cloned().collect()
    }

    pub(crate) fn update(&mut self, id: WorkItemId, update: &StatusUpdate) -> UpdateOutcome<P> {
        let Some(item) = self.items.get_mut(&id) else {
            return UpdateOutcome::NotFound;
        };
        match update.apply_to(item) {
            Ok(()) => UpdateOutcome::Applied(item.clone()),
            Err(actual) => UpdateOutcome::Conflict(actual),
        }
    }

    pub(crate) fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for item in self.items.values() {
            counts.add(item.status);
        }
        counts
    }
}
