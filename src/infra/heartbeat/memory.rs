//! In-memory heartbeat mirror.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{Heartbeat, HeartbeatSink};

#[derive(Default)]
struct Inner {
    latest: HashMap<String, Heartbeat>,
    history: VecDeque<Heartbeat>,
}

/// Keeps the latest heartbeat per job plus a bounded history. Clones share state.
#[derive(Clone)]
pub struct InMemoryHeartbeatSink {
    inner: Arc<Mutex<Inner>>,
    max_history: usize,
}

impl InMemoryHeartbeatSink {
    /// Create a sink keeping at most `max_history` heartbeats.
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_history,
        }
    }

    /// Latest heartbeat for `job`.
    pub fn latest(&self, job: &str) -> Option<Heartbeat> {
        self.inner.lock().latest.get(job).cloned()
    }

    /// Heartbeats for `job`, oldest first.
    pub fn history(&self, job: &str) -> Vec<Heartbeat> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|h| h.job == job)
            .cloned()
            .collect()
    }

    /// Total heartbeats retained.
    pub fn len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HeartbeatSink for InMemoryHeartbeatSink {
    fn record(&self, heartbeat: &Heartbeat) {
        let mut inner = self.inner.lock();
        inner.latest.insert(heartbeat.job.clone(), heartbeat.clone());
        if inner.history.len() >= self.max_history {
            inner.history.pop_front();
        }
        inner.history.push_back(heartbeat.clone());
    }
}
