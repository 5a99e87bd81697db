//! Integration tests for the queue processor state machine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{manual_clock, seed, until, FakeProvider, FakeSession, Post, ScriptedPublisher, Step, T0};
use publish_orchestrator::core::{
    ActionError, ActionReceipt, CircuitBreaker, CircuitState, InMemoryAuditSink, Lookup, PoolLimits,
    ProcessorConfig, PublishAction, QueueProcessor, RateLimiter, RecoverySweeper, SessionPool, StatusUpdate,
    SweeperConfig, TickOutcome, TickSummary, Verification, WorkItemStore, WorkStatus,
};
use publish_orchestrator::infra::InMemoryWorkItemStore;
use publish_orchestrator::util::{ManualClock, Priority};

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    store: Arc<InMemoryWorkItemStore<Post>>,
    provider: FakeProvider,
    pool: SessionPool<FakeProvider>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    clock: ManualClock,
    audit: InMemoryAuditSink,
    processor: QueueProcessor<Post, FakeProvider>,
}

struct Setup {
    config: ProcessorConfig,
    provider: FakeProvider,
    capacity: usize,
    threshold: u32,
    limit: u32,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: ProcessorConfig::default(),
            provider: FakeProvider::new(),
            capacity: 2,
            threshold: 3,
            limit: 10,
        }
    }
}

fn harness_with(action: Arc<dyn PublishAction<Post, FakeSession>>, setup: Setup) -> Harness {
    let clock = manual_clock();
    let store = Arc::new(InMemoryWorkItemStore::new());
    let pool = SessionPool::new(
        PoolLimits {
            capacity: setup.capacity,
            ..PoolLimits::default()
        },
        setup.provider.clone(),
    );
    let breaker = Arc::new(CircuitBreaker::new("publish", setup.threshold, Duration::from_secs(60), clock.shared()));
    let limiter = Arc::new(RateLimiter::new("posts", setup.limit, Duration::from_secs(3600), clock.shared()));
    let audit = InMemoryAuditSink::new(256);
    let processor = QueueProcessor::new(
        setup.config,
        pool.clone(),
        Arc::clone(&store) as Arc<dyn WorkItemStore<Post>>,
        action,
        Arc::clone(&breaker),
        Arc::clone(&limiter),
        clock.shared(),
    )
    .with_audit(Arc::new(audit.clone()));
    Harness {
        store,
        provider: setup.provider,
        pool,
        breaker,
        limiter,
        clock,
        audit,
        processor,
    }
}

fn harness(publisher: ScriptedPublisher, setup: Setup) -> (Harness, Arc<ScriptedPublisher>) {
    let publisher = Arc::new(publisher);
    let h = harness_with(Arc::clone(&publisher) as Arc<dyn PublishAction<Post, FakeSession>>, setup);
    (h, publisher)
}

fn processed(outcome: TickOutcome) -> TickSummary {
    match outcome {
        TickOutcome::Processed(summary) => summary,
        other => panic!("expected a processed tick, got {other:?}"),
    }
}

// ============================================================================
// HAPPY PATH AND GATES
// ============================================================================

#[tokio::test]
async fn successful_publish_marks_done_with_external_ref() {
    let (h, publisher) = harness(ScriptedPublisher::succeeding(), Setup::default());
    seed(&h.store, [1], u128::from(T0)).await;

    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!((summary.attempted, summary.done), (1, 1));

    let item = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Done);
    assert_eq!(item.external_ref.as_deref(), Some("ext-1"));
    assert_eq!(item.attempts, 0);
    assert_eq!(publisher.performed(), 1);

    let health = h.pool.health();
    assert_eq!((health.in_use, health.idle), (0, 1), "session released after the action");
    assert_eq!(h.limiter.remaining(), 9);
    let actions: Vec<_> = h.audit.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec!["in_progress", "done"]);
}

#[tokio::test]
async fn open_breaker_skips_tick_without_acquiring() {
    let (h, publisher) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            threshold: 1,
            ..Setup::default()
        },
    );
    seed(&h.store, [1], u128::from(T0)).await;
    h.breaker.record_failure("surface down");

    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::CircuitOpen);
    assert_eq!(h.provider.created(), 0, "no pool acquisition while open");
    assert_eq!(publisher.performed(), 0);
    assert_eq!(h.store.get(1).await.unwrap().unwrap().status, WorkStatus::Queued);
    assert_eq!(h.limiter.remaining(), 10);
    assert_eq!(h.processor.stats().circuit_skips, 1);
}

#[tokio::test]
async fn rate_limited_item_stays_queued_without_consuming_an_attempt() {
    let (h, _) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            limit: 1,
            config: ProcessorConfig {
                batch_size: 2,
                ..ProcessorConfig::default()
            },
            ..Setup::default()
        },
    );
    seed(&h.store, [1, 2], u128::from(T0)).await;

    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!(summary.done, 1);
    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::RateLimited);

    let second = h.store.get(2).await.unwrap().unwrap();
    assert_eq!(second.status, WorkStatus::Queued);
    assert_eq!(second.attempts, 0);
    assert_eq!(second.last_attempt_at_ms, None);
}

#[tokio::test]
async fn idle_tick_does_not_consume_quota() {
    let (h, _) = harness(ScriptedPublisher::succeeding(), Setup::default());
    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(h.limiter.remaining(), 10);
}

#[tokio::test]
async fn items_scheduled_in_the_future_are_not_picked() {
    let (h, publisher) = harness(ScriptedPublisher::succeeding(), Setup::default());
    seed(&h.store, [1], u128::from(T0) + 60_000).await;
    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::Idle);
    h.clock.advance(Duration::from_secs(60));
    processed(h.processor.tick().await.unwrap());
    assert_eq!(publisher.performed(), 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn transient_failure_requeues_with_backoff() {
    let (h, _) = harness(ScriptedPublisher::new([Step::Transient]), Setup::default());
    seed(&h.store, [1], u128::from(T0)).await;

    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!(summary.requeued, 1);
    let item = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Queued);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.scheduled_at_ms, u128::from(T0) + 300_000);
    assert!(item.last_error.as_deref().unwrap_or("").contains("502"));
    assert_eq!(h.breaker.snapshot().consecutive_failures, 1);

    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::Idle);
    h.clock.advance(Duration::from_secs(300));
    assert_eq!(processed(h.processor.tick().await.unwrap()).done, 1);
    assert_eq!(h.breaker.snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn permanent_failure_fails_immediately_and_keeps_breaker_closed() {
    let (h, _) = harness(
        ScriptedPublisher::new([Step::Permanent]),
        Setup {
            threshold: 1,
            ..Setup::default()
        },
    );
    seed(&h.store, [1], u128::from(T0)).await;

    assert_eq!(processed(h.processor.tick().await.unwrap()).failed, 1);
    let item = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.attempts, 1);
    assert_eq!(h.breaker.state(), CircuitState::Closed);
    assert_eq!(h.audit.with_action("failed").len(), 1);
}

#[tokio::test]
async fn exhausted_attempts_fail_the_item() {
    let (h, _) = harness(
        ScriptedPublisher::new([Step::Transient, Step::Transient]),
        Setup {
            config: ProcessorConfig {
                max_attempts: 2,
                ..ProcessorConfig::default()
            },
            ..Setup::default()
        },
    );
    seed(&h.store, [1], u128::from(T0)).await;

    assert_eq!(processed(h.processor.tick().await.unwrap()).requeued, 1);
    h.clock.advance(Duration::from_secs(300));
    assert_eq!(processed(h.processor.tick().await.unwrap()).failed, 1);

    let item = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Failed);
    assert_eq!(item.attempts, 2);

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::Idle, "terminal items are never retried");
}

#[tokio::test(start_paused = true)]
async fn pool_timeout_requeues_without_touching_breaker_or_quota() {
    let (h, publisher) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            capacity: 1,
            threshold: 1,
            config: ProcessorConfig {
                acquire_timeout: Duration::from_millis(50),
                ..ProcessorConfig::default()
            },
            ..Setup::default()
        },
    );
    seed(&h.store, [1], u128::from(T0)).await;
    let _background = h.pool.acquire(Priority::BACKGROUND, Duration::from_secs(1)).await.unwrap();

    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!(summary.overloaded, 1);
    assert_eq!(publisher.performed(), 0);

    let item = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Queued);
    assert_eq!(item.attempts, 0);
    assert!(item.last_error.as_deref().unwrap_or("").contains("overloaded"));
    assert_eq!(h.breaker.state(), CircuitState::Closed);
    assert_eq!(h.breaker.snapshot().consecutive_failures, 0);
    assert_eq!(h.limiter.remaining(), 10);
    assert_eq!(h.processor.stats().overloaded, 1);
    assert_eq!(h.audit.with_action("overloaded").len(), 1);
    assert_eq!(h.pool.health().waiting, 0);
}

#[tokio::test]
async fn pool_shutdown_returns_item_to_queue_and_stats_track_attempts() {
    let (h, publisher) = harness(ScriptedPublisher::succeeding(), Setup::default());
    seed(&h.store, [1, 2], u128::from(T0)).await;

    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!((summary.attempted, summary.done), (1, 1));

    h.pool.shutdown();
    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!((summary.attempted, summary.done, summary.conflicts), (1, 0, 0));
    let item = h.store.get(2).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Queued);
    assert_eq!(item.attempts, 0);
    assert_eq!(item.last_error.as_deref(), Some("session pool shut down"));
    assert_eq!(publisher.performed(), 1);
    assert_eq!(h.limiter.remaining(), 9, "the refused pickup keeps its quota");

    let stats = h.processor.stats();
    assert_eq!((stats.ticks, stats.attempted, stats.done), (2, 2, 1));
}

#[tokio::test(start_paused = true)]
async fn action_timeout_discards_session_and_counts_as_failure() {
    let (h, _) = harness(
        ScriptedPublisher::new([Step::Hang]),
        Setup {
            config: ProcessorConfig {
                action_timeout: Duration::from_secs(1),
                ..ProcessorConfig::default()
            },
            ..Setup::default()
        },
    );
    seed(&h.store, [1], u128::from(T0)).await;

    assert_eq!(processed(h.processor.tick().await.unwrap()).requeued, 1);
    assert_eq!(h.provider.destroyed(), 1, "timed-out session is not reused");
    let health = h.pool.health();
    assert_eq!((health.in_use, health.idle), (0, 0));
    assert_eq!(h.breaker.snapshot().consecutive_failures, 1);
    let item = h.store.get(1).await.unwrap().unwrap();
    assert!(item.last_error.as_deref().unwrap_or("").contains("timed out"));
}

#[tokio::test]
async fn session_creation_failure_counts_against_breaker() {
    let (h, publisher) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            provider: FakeProvider::new().failing(1),
            ..Setup::default()
        },
    );
    seed(&h.store, [1], u128::from(T0)).await;

    assert_eq!(processed(h.processor.tick().await.unwrap()).requeued, 1);
    assert_eq!(publisher.performed(), 0);
    assert_eq!(h.breaker.snapshot().consecutive_failures, 1);
    assert_eq!(h.limiter.remaining(), 10);
    assert_eq!(h.store.get(1).await.unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn breaker_trips_after_consecutive_failures_and_stops_processing() {
    let (h, publisher) = harness(
        ScriptedPublisher::new([Step::Transient, Step::Transient, Step::Transient]),
        Setup {
            threshold: 3,
            config: ProcessorConfig {
                batch_size: 5,
                max_attempts: 10,
                ..ProcessorConfig::default()
            },
            ..Setup::default()
        },
    );
    seed(&h.store, 1..=5, u128::from(T0)).await;

    let summary = processed(h.processor.tick().await.unwrap());
    assert_eq!(summary.requeued, 3);
    assert_eq!(h.breaker.state(), CircuitState::Open);
    assert_eq!(publisher.performed(), 3, "no attempts after the breaker opened");
    assert_eq!(h.audit.with_action("requeued").len(), 3);
}

#[tokio::test]
async fn half_open_probe_is_returned_when_nothing_is_ready() {
    let (h, _) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            threshold: 1,
            ..Setup::default()
        },
    );
    h.breaker.record_failure("down");
    h.clock.advance(Duration::from_secs(60));

    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(h.breaker.state(), CircuitState::HalfOpen);

    seed(&h.store, [1], u128::from(T0)).await;
    assert_eq!(processed(h.processor.tick().await.unwrap()).done, 1);
    assert_eq!(h.breaker.state(), CircuitState::Closed);
}

// ============================================================================
// RACES WITH THE SWEEPER
// ============================================================================

/// Action that lets the sweeper flag the item mid-flight.
struct FlaggedMidFlight {
    store: Arc<InMemoryWorkItemStore<Post>>,
}

#[async_trait]
impl PublishAction<Post, FakeSession> for FlaggedMidFlight {
    async fn perform(&self, _payload: &Post, _session: &mut FakeSession) -> Result<ActionReceipt, ActionError> {
        let flagged = self
            .store
            .update_status(1, StatusUpdate::transition(WorkStatus::InProgress, WorkStatus::Stuck))
            .await
            .expect("store");
        assert!(flagged.is_applied());
        Ok(ActionReceipt::with_ref("late-ref"))
    }

    async fn verify(&self, _lookup: &Lookup) -> Result<Verification, ActionError> {
        Ok(Verification::missing())
    }
}

#[tokio::test]
async fn completion_wins_over_a_concurrent_stuck_flag() {
    let clock = manual_clock();
    let store = Arc::new(InMemoryWorkItemStore::new());
    let action = Arc::new(FlaggedMidFlight {
        store: Arc::clone(&store),
    });
    let pool = SessionPool::new(PoolLimits::default(), FakeProvider::new());
    let processor = QueueProcessor::new(
        ProcessorConfig::default(),
        pool,
        Arc::clone(&store) as Arc<dyn WorkItemStore<Post>>,
        action,
        Arc::new(CircuitBreaker::new("publish", 3, Duration::from_secs(60), clock.shared())),
        Arc::new(RateLimiter::new("posts", 10, Duration::from_secs(3600), clock.shared())),
        clock.shared(),
    );
    seed(&store, [1], u128::from(T0)).await;

    assert_eq!(processed(processor.tick().await.unwrap()).done, 1);
    let item = store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Done);
    assert_eq!(item.external_ref.as_deref(), Some("late-ref"));
}

#[tokio::test]
async fn item_requeued_while_waiting_for_a_session_is_not_published_twice() {
    let (h, publisher) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            capacity: 1,
            ..Setup::default()
        },
    );
    let sweeper = RecoverySweeper::new(
        SweeperConfig {
            stuck_after: Duration::from_secs(121),
            ..SweeperConfig::default()
        },
        Arc::clone(&h.store) as Arc<dyn WorkItemStore<Post>>,
        Arc::clone(&publisher) as Arc<dyn PublishAction<Post, FakeSession>>,
        h.clock.shared(),
    );
    seed(&h.store, [1], u128::from(T0)).await;
    let held = h.pool.acquire(Priority::BACKGROUND, Duration::from_secs(1)).await.unwrap();

    let interleave = async {
        until(|| h.pool.health().waiting == 1).await;
        h.clock.advance(Duration::from_secs(122));
        let swept = sweeper.sweep().await.unwrap();
        assert_eq!(swept.requeued, 1);
        assert_eq!(h.store.get(1).await.unwrap().unwrap().status, WorkStatus::Queued);
        drop(held);
    };
    let (outcome, ()) = tokio::join!(h.processor.tick(), interleave);

    let summary = processed(outcome.unwrap());
    assert_eq!((summary.done, summary.conflicts), (1, 0));
    let item = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(item.status, WorkStatus::Done);
    assert_eq!(item.external_ref.as_deref(), Some("ext-1"));

    assert_eq!(h.processor.tick().await.unwrap(), TickOutcome::Idle);
    assert_eq!(publisher.performed(), 1);
}

#[tokio::test]
async fn concurrent_ticks_never_process_an_item_twice() {
    let (h, publisher) = harness(
        ScriptedPublisher::succeeding(),
        Setup {
            config: ProcessorConfig {
                batch_size: 6,
                ..ProcessorConfig::default()
            },
            ..Setup::default()
        },
    );
    seed(&h.store, 1..=6, u128::from(T0)).await;

    let done_in = |outcome: TickOutcome| match outcome {
        TickOutcome::Processed(summary) => summary.done,
        _ => 0,
    };
    let (a, b) = futures::join!(h.processor.tick(), h.processor.tick());
    assert_eq!(done_in(a.unwrap()) + done_in(b.unwrap()), 6);
    assert_eq!(publisher.performed(), 6);
    assert_eq!(h.store.counts().await.unwrap().done, 6);
}
