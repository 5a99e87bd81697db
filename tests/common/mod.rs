//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use publish_orchestrator::core::{
    ActionError, ActionReceipt, Lookup, PublishAction, SessionProvider, Verification, WorkItem,
    WorkItemStore,
};
use publish_orchestrator::infra::InMemoryWorkItemStore;
use publish_orchestrator::util::{ManualClock, SessionId, WorkItemId};
use serde::{Deserialize, Serialize};

// ============================================================================
// SESSION PROVIDER
// ============================================================================

/// Session handed out by [`FakeProvider`].
#[derive(Debug)]
pub struct FakeSession {
    pub id: SessionId,
    pub uses: u64,
}

/// Provider that counts lifecycle calls and can be told to fail.
#[derive(Clone, Default)]
pub struct FakeProvider {
    pub created: Arc<AtomicUsize>,
    pub destroyed: Arc<AtomicUsize>,
    pub force_closed: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
    create_delay: Duration,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` creations fail.
    pub fn failing(self, n: usize) -> Self {
        self.fail_next.store(n, Ordering::SeqCst);
        self
    }

    /// Every creation takes `delay`.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn force_closed(&self) -> usize {
        self.force_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    type Session = FakeSession;

    async fn create(&self, id: SessionId) -> anyhow::Result<FakeSession> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            anyhow::bail!("browser launch failed");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession { id, uses: 0 })
    }

    fn destroy(&self, _id: SessionId, _session: FakeSession) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn force_close(&self, _id: SessionId) {
        self.force_closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// PUBLISH ACTION
// ============================================================================

/// Work item payload used across tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub text: String,
}

impl Post {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Scripted outcome of one `perform` call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(String),
    Transient,
    Permanent,
    Hang,
}

/// Publisher that replays a script, then succeeds with `ext-<n>` references.
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Step>>,
    verify_answer: Mutex<Result<Verification, ActionError>>,
    lookups: Mutex<Vec<Lookup>>,
    search_by_text: bool,
    pub performed: AtomicUsize,
}

impl ScriptedPublisher {
    pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            verify_answer: Mutex::new(Ok(Verification::missing())),
            lookups: Mutex::new(Vec::new()),
            search_by_text: false,
            performed: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new([])
    }

    /// Derive search keys from the post text.
    pub fn with_search_keys(mut self) -> Self {
        self.search_by_text = true;
        self
    }

    pub fn answer_verify(&self, answer: Result<Verification, ActionError>) {
        *self.verify_answer.lock() = answer;
    }

    pub fn lookups(&self) -> Vec<Lookup> {
        self.lookups.lock().clone()
    }

    pub fn performed(&self) -> usize {
        self.performed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishAction<Post, FakeSession> for ScriptedPublisher {
    async fn perform(&self, _payload: &Post, session: &mut FakeSession) -> Result<ActionReceipt, ActionError> {
        let n = self.performed.fetch_add(1, Ordering::SeqCst) + 1;
        session.uses += 1;
        let step = self.script.lock().pop_front();
        match step {
            None => Ok(ActionReceipt::with_ref(format!("ext-{n}"))),
            Some(Step::Succeed(external_ref)) => Ok(ActionReceipt::with_ref(external_ref)),
            Some(Step::Transient) => Err(ActionError::Transient("502 bad gateway".into())),
            Some(Step::Permanent) => Err(ActionError::Permanent("content rejected".into())),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(ActionReceipt::default())
            }
        }
    }

    async fn verify(&self, lookup: &Lookup) -> Result<Verification, ActionError> {
        self.lookups.lock().push(lookup.clone());
        self.verify_answer.lock().clone()
    }

    fn search_key(&self, payload: &Post) -> Option<String> {
        self.search_by_text.then(|| payload.text.clone())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Wall-clock start used by every test.
pub const T0: u64 = 1_700_000_000_000;

pub fn manual_clock() -> ManualClock {
    ManualClock::new(T0)
}

/// Insert `ids` as queued posts scheduled at `at_ms`.
pub async fn seed(store: &InMemoryWorkItemStore<Post>, ids: impl IntoIterator<Item = WorkItemId>, at_ms: u128) {
    for id in ids {
        store
            .insert(WorkItem::new(id, Post::new(format!("post {id}")), at_ms))
            .await
            .expect("seed insert");
    }
}

/// Poll until `cond` holds, yielding to other tasks in between.
pub async fn until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
