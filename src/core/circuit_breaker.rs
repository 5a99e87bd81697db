//! Circuit breaker guarding one external failure domain.
//!
//! `Closed` admits everything. After `failure_threshold` consecutive failures
//! the breaker opens and [`CircuitBreaker::allow`] fails fast. Once the cooldown
//! has elapsed exactly one probe is admitted (`HalfOpen`); its success closes
//! the breaker, its failure re-opens it.
//!
//! Use one instance per independent surface (publishing, scraping, ...) so an
//! outage in one does not block the other.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::audit::{self, SharedAuditSink};
use crate::util::clock::{duration_ms, SharedClock};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Cooldown elapsed; one probe admitted.
    HalfOpen,
}

impl CircuitState {
    const fn audit_action(self) -> &'static str {
        match self {
            Self::Closed => "circuit_closed",
            Self::Open => "circuit_open",
            Self::HalfOpen => "circuit_half_open",
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Breaker (failure domain) name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the breaker last opened (ms since epoch).
    pub opened_at_ms: Option<u128>,
    /// Number of times the breaker has tripped open.
    pub trips: u64,
    /// Most recent failure reason.
    pub last_error: Option<String>,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: Option<u128>,
    probe_started_ms: Option<u128>,
    trips: u64,
    last_error: Option<String>,
}

/// Mutex-guarded circuit breaker.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown_ms: u128,
    clock: SharedClock,
    audit: Option<SharedAuditSink>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown_ms: duration_ms(cooldown),
            clock,
            audit: None,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_ms: None,
                probe_started_ms: None,
                trips: 0,
                last_error: None,
            }),
        }
    }

    /// Attach an audit sink for state changes.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    fn cooldown_elapsed(&self, opened_at_ms: Option<u128>, now: u128) -> bool {
        opened_at_ms.is_none_or(|opened| now >= opened.saturating_add(self.cooldown_ms))
    }

    fn transition(&self, inner: &mut BreakerState, next: CircuitState, now: u128) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        match next {
            CircuitState::Open => {
                inner.opened_at_ms = Some(now);
                inner.probe_started_ms = None;
                inner.trips += 1;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    last_error = inner.last_error.as_deref().unwrap_or(""),
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.probe_started_ms = Some(now);
                tracing::info!(breaker = %self.name, "circuit half-open, admitting probe");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at_ms = None;
                inner.probe_started_ms = None;
                tracing::info!(breaker = %self.name, "circuit closed");
            }
        }
        audit::record(
            self.audit.as_ref(),
            &format!("breaker:{}", self.name),
            self.name.clone(),
            next.audit_action(),
            Some(format!("{previous:?} -> {next:?}")),
        );
    }

    /// Whether the protected operation may be attempted now.
    ///
    /// While open this returns `false` without side effects. After the
    /// cooldown it admits a single probe.
    pub fn allow(&self) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.state.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cooldown_elapsed(inner.opened_at_ms, now) {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A probe outstanding for longer than the cooldown is treated as lost.
                let lost = inner
                    .probe_started_ms
                    .is_none_or(|started| now >= started.saturating_add(self.cooldown_ms));
                if lost {
                    inner.probe_started_ms = Some(now);
                }
                lost
            }
        }
    }

    /// Give back a half-open probe that never reached the protected operation.
    pub fn abandon_probe(&self) {
        let mut inner = self.state.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_started_ms = None;
        }
    }

    /// Record a successful protected operation.
    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.state.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Closed, now),
            CircuitState::Open => {
                if self.cooldown_elapsed(inner.opened_at_ms, now) {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
        }
    }

    /// Record a failed protected operation.
    pub fn record_failure(&self, reason: impl Into<String>) {
        let now = self.clock.now_ms();
        let mut inner = self.state.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_error = Some(reason.into());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.state.lock();
        self.transition(&mut inner, CircuitState::Closed, now);
        inner.consecutive_failures = 0;
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.state.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at_ms: inner.opened_at_ms,
            trips: inner.trips,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::InMemoryAuditSink;
    use crate::util::clock::ManualClock;
    use std::sync::Arc;

    fn breaker(threshold: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new(50_000);
        let breaker = CircuitBreaker::new("publish", threshold, Duration::from_secs(60), clock.shared());
        (breaker, clock)
    }

    #[test]
    fn trips_after_threshold_and_recovers_after_probe() {
        let (breaker, clock) = breaker(3);
        breaker.record_failure("timeout");
        breaker.record_failure("timeout");
        assert!(breaker.allow());
        breaker.record_failure("timeout");
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(60));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow(), "only one probe while half-open");

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure("down");
        clock.advance(Duration::from_secs(61));
        assert!(breaker.allow());
        breaker.record_failure("still down");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        assert_eq!(breaker.snapshot().trips, 2);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let (breaker, _clock) = breaker(2);
        breaker.record_failure("a");
        breaker.record_success();
        breaker.record_failure("b");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn abandoned_probe_can_be_reissued() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure("down");
        clock.advance(Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.abandon_probe();
        assert!(breaker.allow());
    }

    #[test]
    fn lost_probe_expires_after_cooldown() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure("down");
        clock.advance(Duration::from_secs(60));
        assert!(breaker.allow());
        clock.advance(Duration::from_secs(30));
        assert!(!breaker.allow());
        clock.advance(Duration::from_secs(30));
        assert!(breaker.allow());
    }

    #[test]
    fn state_changes_are_audited() {
        let sink = InMemoryAuditSink::new(16);
        let clock = ManualClock::new(0);
        let breaker = CircuitBreaker::new("scrape", 1, Duration::from_secs(5), clock.shared())
            .with_audit(Arc::new(sink.clone()));
        breaker.record_failure("boom");
        clock.advance(Duration::from_secs(5));
        breaker.allow();
        breaker.record_success();
        let actions: Vec<_> = sink.events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["circuit_open", "circuit_half_open", "circuit_closed"]);
    }
}
