//! In-memory work item store.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::ItemTable;
use crate::core::{SchedulerError, StatusCounts, StatusUpdate, UpdateOutcome, WorkItem, WorkItemStore};
use crate::util::serde::WorkItemId;

/// Work item store for development and tests. Nothing survives a restart.
pub struct InMemoryWorkItemStore<P> {
    table: Mutex<ItemTable<P>>,
}

impl<P: Clone> InMemoryWorkItemStore<P> {
    /// Create an empty store.
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(ItemTable::new()),
        }
    }

    /// Every stored item, ordered by id.
    pub fn items(&self) -> Vec<WorkItem<P>> {
        self.table.lock().all()
    }
}

impl<P: Clone> Default for InMemoryWorkItemStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P> WorkItemStore<P> for InMemoryWorkItemStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn insert(&self, item: WorkItem<P>) -> Result<(), SchedulerError> {
        self.table.lock().insert(item)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem<P>>, SchedulerError> {
        Ok(self.table.lock().get(id))
    }

    async fn fetch_ready(&self, now_ms: u128, limit: usize) -> Result<Vec<WorkItem<P>>, SchedulerError> {
        Ok(self.table.lock().fetch_ready(now_ms, limit))
    }

    async fn update_status(
        &self,
        id: WorkItemId,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome<P>, SchedulerError> {
        Ok(self.table.lock().update(id, &update))
    }

    async fn fetch_stuck(&self, cutoff_ms: u128, limit: usize) -> Result<Vec<WorkItem<P>>, SchedulerError> {
        Ok(self.table.lock().fetch_stuck(cutoff_ms, limit))
    }

    async fn counts(&self) -> Result<StatusCounts, SchedulerError> {
        Ok(self.table.lock().counts())
    }
}
