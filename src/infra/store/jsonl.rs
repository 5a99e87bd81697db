//! File-backed work item store.
//!
//! Every insert and applied update appends the full record as one JSON line.
//! On open the journal is replayed; the last line for an id wins. Call
//! [`JsonlWorkItemStore::compact`] to rewrite the journal with one line per
//! item.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use super::ItemTable;
use crate::core::{SchedulerError, StatusCounts, StatusUpdate, UpdateOutcome, WorkItem, WorkItemStore};
use crate::util::serde::WorkItemId;

fn storage(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Storage(e.to_string())
}

/// Durable work item store using a JSON lines journal.
pub struct JsonlWorkItemStore<P> {
    file_path: PathBuf,
    table: Mutex<ItemTable<P>>,
}

impl<P> JsonlWorkItemStore<P>
where
    P: Clone + Serialize + DeserializeOwned,
{
    /// Open (or create) the store `name` under directory `path`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Storage` if the directory cannot be created or
    /// the journal cannot be read.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self, SchedulerError> {
        let dir = path.as_ref();
        create_dir_all(dir).map_err(storage)?;
        let file_path = dir.join(format!("{name}.jsonl"));
        let mut table = ItemTable::new();
        let mut replayed = 0usize;
        if file_path.exists() {
            let file = OpenOptions::new().read(true).open(&file_path).map_err(storage)?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(storage)?;
                if line.trim().is_empty() {
                    continue;
                }
                let item: WorkItem<P> = serde_json::from_str(&line).map_err(storage)?;
                table.put(item);
                replayed += 1;
            }
        }
        tracing::debug!(path = %file_path.display(), replayed, "work item journal opened");
        Ok(Self {
            file_path,
            table: Mutex::new(table),
        })
    }

    /// Journal location.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn append(&self, item: &WorkItem<P>) -> Result<(), SchedulerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(storage)?;
        let line = serde_json::to_string(item).map_err(storage)?;
        writeln!(file, "{line}").map_err(storage)
    }

    /// Rewrite the journal with the current record of each item.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Storage` on I/O failure.
    pub fn compact(&self) -> Result<(), SchedulerError> {
        let table = self.table.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.file_path)
            .map_err(storage)?;
        for item in table.all() {
            let line = serde_json::to_string(&item).map_err(storage)?;
            writeln!(file, "{line}").map_err(storage)?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P> WorkItemStore<P> for JsonlWorkItemStore<P>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn insert(&self, item: WorkItem<P>) -> Result<(), SchedulerError> {
        let mut table = self.table.lock();
        if table.contains(item.id) {
            return Err(SchedulerError::Storage(format!("work item {} already exists", item.id)));
        }
        self.append(&item)?;
        table.insert(item)
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
        let mut table = self.table.lock();
        let Some(mut item) = table.get(id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if let Err(actual) = update.apply_to(&mut item) {
            return Ok(UpdateOutcome::Conflict(actual));
        }
        // Journal first so memory never runs ahead of disk.
        self.append(&item)?;
        table.put(item.clone());
        Ok(UpdateOutcome::Applied(item))
    }

    async fn fetch_stuck(&self, cutoff_ms: u128, limit: usize) -> Result<Vec<WorkItem<P>>, SchedulerError> {
        Ok(self.table.lock().fetch_stuck(cutoff_ms, limit))
    }

    async fn counts(&self) -> Result<StatusCounts, SchedulerError> {
        Ok(self.table.lock().counts())
    }
}
