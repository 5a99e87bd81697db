//! Bounded pool of automation sessions with strict priority hand-off.
//!
//! The pool owns at most `capacity` sessions. `acquire` hands out an idle
//! session immediately, creates a new one while under capacity, and otherwise
//! parks the caller in a waiter heap ordered by `(priority, arrival)`. A
//! released session (or a freed slot) always goes to the best waiter present,
//! so a publish that arrives last is still served before earlier background
//! callers.
//!
//! All bookkeeping lives behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Grants travel to waiters over `oneshot` channels and are
//! accounted for before they are sent, so a session is never counted twice and
//! never handed to two callers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::core::error::PoolError;
use crate::core::scheduler::PeriodicTask;
use crate::util::serde::{Priority, SessionId};

/// Factory for the scarce external resource.
///
/// Only the pool calls this; consumers go through [`SessionPool::acquire`].
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    /// Session handle (browser context, page, connection, ...).
    type Session: Send + 'static;

    /// Materialize a new session. Cold-start cost is charged to the caller
    /// whose acquire triggered it.
    async fn create(&self, id: SessionId) -> anyhow::Result<Self::Session>;

    /// Tear down a session that is being recycled or discarded.
    fn destroy(&self, _id: SessionId, session: Self::Session) {
        drop(session);
    }

    /// Forcibly close a session whose lease exceeded the hard ceiling. The
    /// handle itself is still held by the stalled caller.
    fn force_close(&self, _id: SessionId) {}

    /// Memory or health heuristic; `true` recycles the session on release.
    fn needs_recycle(&self, _session: &Self::Session) -> bool {
        false
    }
}

/// Lifecycle state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Available for acquisition.
    Idle,
    /// Exclusively held by one caller.
    InUse,
    /// Being destroyed; never handed out again.
    Recycling,
}

/// Capacity and recycling limits.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Maximum number of live sessions.
    pub capacity: usize,
    /// Recycle a session after serving this many operations.
    pub max_operations: u64,
    /// Recycle a session older than this.
    pub max_age: Duration,
    /// Reclaim a lease held longer than this.
    pub lease_ceiling: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            capacity: 3,
            max_operations: 50,
            max_age: Duration::from_secs(30 * 60),
            lease_ceiling: Duration::from_secs(10 * 60),
        }
    }
}

/// A pooled session and its bookkeeping.
pub struct PoolSession<S> {
    id: SessionId,
    created_at: Instant,
    operations_served: u64,
    state: SessionState,
    lease_token: u64,
    handle: S,
}

impl<S> PoolSession<S> {
    fn new(id: SessionId, handle: S) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            operations_served: 0,
            state: SessionState::Idle,
            lease_token: 0,
            handle,
        }
    }

    /// Session identifier.
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Operations completed on this session.
    pub const fn operations_served(&self) -> u64 {
        self.operations_served
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Read-only pool health snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolHealth {
    /// Configured capacity.
    pub capacity: usize,
    /// Sessions currently leased.
    pub in_use: usize,
    /// Sessions ready for reuse.
    pub idle: usize,
    /// Sessions being created.
    pub creating: usize,
    /// Callers waiting for a session.
    pub waiting: usize,
    /// Mean wait of callers served from the waiter queue (immediate grants count as zero).
    pub avg_wait_ms: f64,
    /// Acquisitions served.
    pub served: u64,
    /// Sessions created.
    pub sessions_created: u64,
    /// Sessions destroyed by recycling or discard.
    pub sessions_recycled: u64,
    /// Session creations that failed.
    pub creation_failures: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Leases reclaimed by the watchdog.
    pub reclaimed: u64,
}

enum Grant<S> {
    Session(PoolSession<S>),
    /// Permission to create a session in a freed slot.
    Slot,
}

struct Waiter<S> {
    priority: Priority,
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant<S>>,
}

impl<S> PartialEq for Waiter<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S> Eq for Waiter<S> {}

impl<S> PartialOrd for Waiter<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Waiter<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: lowest priority value first, then earliest arrival.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Checkout {
    token: u64,
    since: Instant,
}

#[derive(Default)]
struct PoolCounters {
    served: u64,
    total_wait: Duration,
    created: u64,
    recycled: u64,
    creation_failures: u64,
    timeouts: u64,
    reclaimed: u64,
}

impl PoolCounters {
    /// Count one lease handed to a caller after `waited` in the queue.
    fn serve(&mut self, waited: Duration) {
        self.served += 1;
        self.total_wait += waited;
    }
}

struct PoolState<S> {
    idle: VecDeque<PoolSession<S>>,
    in_use: HashMap<SessionId, Checkout>,
    creating: usize,
    waiters: BinaryHeap<Waiter<S>>,
    shutdown: bool,
    counters: PoolCounters,
}

impl<S> PoolState<S> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.creating
    }
}

enum Step<S> {
    Ready(PoolSession<S>),
    Create,
    Wait(u64, oneshot::Receiver<Grant<S>>),
}

struct PoolShared<P: SessionProvider> {
    limits: PoolLimits,
    provider: P,
    state: Mutex<PoolState<P::Session>>,
    next_session_id: AtomicU64,
    next_token: AtomicU64,
}

impl<P: SessionProvider> PoolShared<P> {
    fn checkout(&self, state: &mut PoolState<P::Session>, session: &mut PoolSession<P::Session>) {
        let token = self.next_token.fetch_add(1, AtomicOrdering::Relaxed);
        session.lease_token = token;
        session.state = SessionState::InUse;
        state.in_use.insert(
            session.id,
            Checkout {
                token,
                since: Instant::now(),
            },
        );
    }

    fn undo_grant(state: &mut PoolState<P::Session>, grant: &Grant<P::Session>) {
        match grant {
            Grant::Session(session) => {
                state.in_use.remove(&session.id);
            }
            Grant::Slot => state.creating -= 1,
        }
    }

    /// Give a session or a free slot to the best waiter, or park it.
    fn hand_off(&self, state: &mut PoolState<P::Session>, mut grant: Grant<P::Session>) {
        while let Some(waiter) = state.waiters.pop() {
            match &mut grant {
                Grant::Session(session) => self.checkout(state, session),
                Grant::Slot => state.creating += 1,
            }
            match waiter.tx.send(grant) {
                Ok(()) => {
                    tracing::trace!(
                        waiter = waiter.id,
                        priority = %waiter.priority,
                        queued_ms = u64::try_from(waiter.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "grant handed to waiter"
                    );
                    return;
                }
                Err(returned) => {
                    // Receiver already gone; try the next waiter.
                    Self::undo_grant(state, &returned);
                    grant = returned;
                }
            }
        }
        if let Grant::Session(mut session) = grant {
            session.state = SessionState::Idle;
            state.idle.push_back(session);
        }
    }

    fn is_stale(&self, session: &PoolSession<P::Session>) -> bool {
        session.created_at.elapsed() >= self.limits.max_age
            || self.provider.needs_recycle(&session.handle)
    }

    fn begin_acquire(
        &self,
        priority: Priority,
    ) -> (Result<Step<P::Session>, PoolError>, Vec<PoolSession<P::Session>>) {
        let mut stale = Vec::new();
        let mut state = self.state.lock();
        if state.shutdown {
            return (Err(PoolError::Shutdown), stale);
        }
        // New callers never barge ahead of parked waiters.
        if state.waiters.is_empty() {
            while let Some(mut session) = state.idle.pop_front() {
                if self.is_stale(&session) {
                    session.state = SessionState::Recycling;
                    state.counters.recycled += 1;
                    stale.push(session);
                    continue;
                }
                self.checkout(&mut state, &mut session);
                state.counters.serve(Duration::ZERO);
                return (Ok(Step::Ready(session)), stale);
            }
            if state.total() < self.limits.capacity {
                state.creating += 1;
                return (Ok(Step::Create), stale);
            }
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_token.fetch_add(1, AtomicOrdering::Relaxed);
        state.waiters.push(Waiter {
            priority,
            id,
            enqueued_at: Instant::now(),
            tx,
        });
        tracing::debug!(
            waiter = id,
            priority = %priority,
            waiting = state.waiters.len(),
            "pool saturated, caller parked"
        );
        (Ok(Step::Wait(id, rx)), stale)
    }

    fn check_in(&self, mut session: PoolSession<P::Session>, discard: bool) {
        let doomed = {
            let mut state = self.state.lock();
            let owned = state
                .in_use
                .get(&session.id)
                .is_some_and(|c| c.token == session.lease_token);
            if owned {
                state.in_use.remove(&session.id);
                session.operations_served += 1;
                let recycle = discard
                    || state.shutdown
                    || session.operations_served >= self.limits.max_operations
                    || self.is_stale(&session);
                if recycle {
                    session.state = SessionState::Recycling;
                    state.counters.recycled += 1;
                    tracing::debug!(
                        session_id = session.id,
                        operations = session.operations_served,
                        discard,
                        "recycling session"
                    );
                    self.hand_off(&mut state, Grant::Slot);
                    Some(session)
                } else {
                    self.hand_off(&mut state, Grant::Session(session));
                    None
                }
            } else {
                tracing::warn!(
                    session_id = session.id,
                    "reclaimed session returned after lease ceiling, destroying"
                );
                Some(session)
            }
        };
        if let Some(session) = doomed {
            self.destroy(session);
        }
    }

    fn destroy(&self, session: PoolSession<P::Session>) {
        let PoolSession { id, handle, .. } = session;
        self.provider.destroy(id, handle);
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.creating -= 1;
        self.hand_off(&mut state, Grant::Slot);
    }
}

/// Await `fut` until `deadline`; `None` means no deadline. Returns `None` on expiry.
async fn until_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Holds a reserved creation slot; frees it unless disarmed.
struct SlotGuard<P: SessionProvider> {
    shared: Arc<PoolShared<P>>,
    armed: bool,
}

impl<P: SessionProvider> Drop for SlotGuard<P> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// Removes a parked waiter on timeout or cancellation.
struct WaitGuard<P: SessionProvider> {
    shared: Arc<PoolShared<P>>,
    id: u64,
    rx: oneshot::Receiver<Grant<P::Session>>,
    armed: bool,
}

impl<P: SessionProvider> Drop for WaitGuard<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.state.lock();
        let before = state.waiters.len();
        let id = self.id;
        state.waiters.retain(|w| w.id != id);
        if state.waiters.len() == before {
            // Already popped: the grant was sent under the lock, so it is in the channel.
            if let Ok(grant) = self.rx.try_recv() {
                PoolShared::<P>::undo_grant(&mut state, &grant);
                self.shared.hand_off(&mut state, grant);
            }
        }
    }
}

/// Exclusive lease on a pooled session.
///
/// Dropping the lease releases the session back to the pool, so release
/// happens on every path including errors, panics, and cancellation.
pub struct SessionLease<P: SessionProvider> {
    shared: Arc<PoolShared<P>>,
    session: Option<PoolSession<P::Session>>,
    discard: bool,
}

impl<P: SessionProvider> SessionLease<P> {
    fn inner(&self) -> &PoolSession<P::Session> {
        match self.session.as_ref() {
            Some(session) => session,
            None => unreachable!("lease holds its session until dropped"),
        }
    }

    /// Leased session id.
    pub fn id(&self) -> SessionId {
        self.inner().id
    }

    /// Operations the session had served before this lease.
    pub fn operations_served(&self) -> u64 {
        self.inner().operations_served
    }

    /// Lifecycle state (always `InUse` while leased).
    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    /// Borrow the session handle.
    pub fn session(&self) -> &P::Session {
        &self.inner().handle
    }

    /// Mutably borrow the session handle.
    pub fn session_mut(&mut self) -> &mut P::Session {
        match self.session.as_mut() {
            Some(session) => &mut session.handle,
            None => unreachable!("lease holds its session until dropped"),
        }
    }

    /// Destroy the session on release instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.discard = true;
    }

    /// Release the session to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Destroy the session and free its slot.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<P: SessionProvider> Drop for SessionLease<P> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.shared.check_in(session, self.discard);
        }
    }
}

/// Bounded, priority-ordered session pool.
pub struct SessionPool<P: SessionProvider> {
    shared: Arc<PoolShared<P>>,
}

impl<P: SessionProvider> Clone for SessionPool<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: SessionProvider> SessionPool<P> {
    /// Create an empty pool. Sessions are created lazily on demand.
    pub fn new(limits: PoolLimits, provider: P) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                limits,
                provider,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashMap::new(),
                    creating: 0,
                    waiters: BinaryHeap::new(),
                    shutdown: false,
                    counters: PoolCounters::default(),
                }),
                next_session_id: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> &PoolLimits {
        &self.shared.limits
    }

    /// The session provider.
    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    fn lease(&self, session: PoolSession<P::Session>) -> SessionLease<P> {
        tracing::trace!(session_id = session.id, "session leased");
        SessionLease {
            shared: Arc::clone(&self.shared),
            session: Some(session),
            discard: false,
        }
    }

    /// Acquire a session, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `PoolError::Timeout` if no session became available in time
    /// - `PoolError::SessionCreation` if this caller's cold start failed
    /// - `PoolError::Shutdown` if the pool is shut down
    pub async fn acquire(
        &self,
        priority: Priority,
        timeout: Duration,
    ) -> Result<SessionLease<P>, PoolError> {
        // No deadline when the timeout is too large to represent.
        let deadline = Instant::now().checked_add(timeout);
        let (step, stale) = self.shared.begin_acquire(priority);
        for session in stale {
            self.shared.destroy(session);
        }
        match step? {
            Step::Ready(session) => Ok(self.lease(session)),
            Step::Create => self.create_session(deadline, timeout, Duration::ZERO).await,
            Step::Wait(id, rx) => self.wait(id, rx, deadline, timeout).await,
        }
    }

    async fn create_session(
        &self,
        deadline: Option<Instant>,
        timeout: Duration,
        waited: Duration,
    ) -> Result<SessionLease<P>, PoolError> {
        let mut slot = SlotGuard {
            shared: Arc::clone(&self.shared),
            armed: true,
        };
        let id = self.shared.next_session_id.fetch_add(1, AtomicOrdering::Relaxed);
        let started = Instant::now();
        let created = until_deadline(deadline, self.shared.provider.create(id)).await;
        match created {
            None => {
                self.shared.state.lock().counters.timeouts += 1;
                tracing::warn!(session_id = id, "session creation exceeded acquire timeout");
                Err(PoolError::Timeout(timeout))
            }
            Some(Err(err)) => {
                self.shared.state.lock().counters.creation_failures += 1;
                tracing::warn!(session_id = id, error = %err, "session creation failed");
                Err(PoolError::SessionCreation(err.to_string()))
            }
            Some(Ok(handle)) => {
                let mut session = PoolSession::new(id, handle);
                let mut state = self.shared.state.lock();
                state.creating -= 1;
                slot.armed = false;
                if state.shutdown {
                    drop(state);
                    self.shared.destroy(session);
                    return Err(PoolError::Shutdown);
                }
                state.counters.created += 1;
                state.counters.serve(waited);
                self.shared.checkout(&mut state, &mut session);
                drop(state);
                tracing::info!(
                    session_id = id,
                    cold_start_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "session created"
                );
                Ok(self.lease(session))
            }
        }
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Grant<P::Session>>,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<SessionLease<P>, PoolError> {
        let parked = Instant::now();
        let mut guard = WaitGuard {
            shared: Arc::clone(&self.shared),
            id,
            rx,
            armed: true,
        };
        let outcome = until_deadline(deadline, &mut guard.rx).await;
        match outcome {
            Some(Ok(grant)) => {
                guard.armed = false;
                let waited = parked.elapsed();
                match grant {
                    Grant::Session(session) => {
                        self.shared.state.lock().counters.serve(waited);
                        Ok(self.lease(session))
                    }
                    // The freed slot is already counted as creating.
                    Grant::Slot => self.create_session(deadline, timeout, waited).await,
                }
            }
            Some(Err(_)) => {
                guard.armed = false;
                Err(PoolError::Shutdown)
            }
            None => {
                drop(guard);
                self.shared.state.lock().counters.timeouts += 1;
                tracing::debug!(waiter = id, "pool acquire timed out");
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Explicitly release a lease. Equivalent to dropping it.
    pub fn release(&self, lease: SessionLease<P>) {
        lease.release();
    }

    /// Reclaim leases held longer than the hard ceiling.
    ///
    /// The slot is freed immediately and the provider is asked to force-close
    /// the session; when the stalled caller eventually returns the lease, the
    /// session is destroyed instead of re-entering the pool.
    pub fn reap_overdue(&self) -> usize {
        let ceiling = self.shared.limits.lease_ceiling;
        let now = Instant::now();
        let reclaimed: Vec<SessionId> = {
            let mut state = self.shared.state.lock();
            let overdue: Vec<SessionId> = state
                .in_use
                .iter()
                .filter(|(_, c)| now.saturating_duration_since(c.since) >= ceiling)
                .map(|(id, _)| *id)
                .collect();
            for id in &overdue {
                state.in_use.remove(id);
                state.counters.reclaimed += 1;
                self.shared.hand_off(&mut state, Grant::Slot);
            }
            overdue
        };
        for id in &reclaimed {
            tracing::warn!(session_id = id, ceiling_secs = ceiling.as_secs(), "lease exceeded ceiling, slot reclaimed");
            self.shared.provider.force_close(*id);
        }
        reclaimed.len()
    }

    /// Stop handing out sessions, destroy idle ones, and fail parked waiters.
    pub fn shutdown(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            (idle, std::mem::take(&mut state.waiters))
        };
        tracing::info!(idle = idle.len(), waiters = waiters.len(), "session pool shutting down");
        drop(waiters);
        for session in idle {
            self.shared.destroy(session);
        }
    }

    /// Health snapshot for monitoring.
    pub fn health(&self) -> PoolHealth {
        let state = self.shared.state.lock();
        let counters = &state.counters;
        #[allow(clippy::cast_precision_loss)]
        let avg_wait_ms = if counters.served == 0 {
            0.0
        } else {
            counters.total_wait.as_secs_f64() * 1000.0 / counters.served as f64
        };
        PoolHealth {
            capacity: self.shared.limits.capacity,
            in_use: state.in_use.len(),
            idle: state.idle.len(),
            creating: state.creating,
            waiting: state.waiters.len(),
            avg_wait_ms,
            served: counters.served,
            sessions_created: counters.created,
            sessions_recycled: counters.recycled,
            creation_failures: counters.creation_failures,
            timeouts: counters.timeouts,
            reclaimed: counters.reclaimed,
        }
    }
}

/// Periodic task that runs [`SessionPool::reap_overdue`].
pub struct PoolWatchdog<P: SessionProvider> {
    pool: SessionPool<P>,
}

impl<P: SessionProvider> PoolWatchdog<P> {
    /// Watch `pool`.
    pub const fn new(pool: SessionPool<P>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<P: SessionProvider> PeriodicTask for PoolWatchdog<P> {
    async fn run(&self) -> anyhow::Result<()> {
        let reclaimed = self.pool.reap_overdue();
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "pool watchdog reclaimed leases");
        }
        Ok(())
    }
}
