//! Rolling-window admission control for externally visible actions.
//!
//! A limiter admits at most `limit` actions per `window`. When wall-clock time
//! passes `window_start + window`, the window resets before admission is
//! evaluated. Denials are not queued: the caller's next scheduled tick is the
//! retry.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::{duration_ms, SharedClock};

/// State of one rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    /// Start of the current window (ms since epoch).
    pub window_start_ms: u128,
    /// Admissions granted in the current window.
    pub count: u32,
    /// Maximum admissions per window.
    pub limit: u32,
}

/// Proof of one admission, used to give quota back when no action happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    window_start_ms: u128,
}

/// Observable limiter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSnapshot {
    /// Limiter name.
    pub name: String,
    /// Current window.
    pub window: RateWindow,
    /// Window length in milliseconds.
    pub window_ms: u128,
    /// Total denials since start.
    pub denied: u64,
}

struct LimiterState {
    window: RateWindow,
    denied: u64,
}

/// Mutex-guarded rolling-window rate limiter.
pub struct RateLimiter {
    name: String,
    window_ms: u128,
    clock: SharedClock,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter admitting `limit` actions per `window`.
    pub fn new(name: impl Into<String>, limit: u32, window: Duration, clock: SharedClock) -> Self {
        let window_start_ms = clock.now_ms();
        Self {
            name: name.into(),
            window_ms: duration_ms(window),
            clock,
            state: Mutex::new(LimiterState {
                window: RateWindow {
                    window_start_ms,
                    count: 0,
                    limit,
                },
                denied: 0,
            }),
        }
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn roll(&self, window: &mut RateWindow, now: u128) {
        if now >= window.window_start_ms.saturating_add(self.window_ms) {
            window.window_start_ms = now;
            window.count = 0;
        }
    }

    /// Try to admit one action, returning a refundable admission.
    pub fn admit(&self) -> Option<Admission> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.roll(&mut state.window, now);
        if state.window.count < state.window.limit {
            state.window.count += 1;
            Some(Admission {
                window_start_ms: state.window.window_start_ms,
            })
        } else {
            state.denied += 1;
            tracing::debug!(
                limiter = %self.name,
                count = state.window.count,
                limit = state.window.limit,
                "rate limit reached"
            );
            None
        }
    }

    /// Try to admit one action.
    pub fn try_admit(&self) -> bool {
        self.admit().is_some()
    }

    /// Give back an admission that did not result in an action.
    ///
    /// Ignored if the window that issued it has already rolled over.
    pub fn refund(&self, admission: Admission) {
        let mut state = self.state.lock();
        if state.window.window_start_ms == admission.window_start_ms && state.window.count > 0 {
            state.window.count -= 1;
        }
    }

    /// Admissions left in the current window.
    pub fn remaining(&self) -> u32 {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.roll(&mut state.window, now);
        state.window.limit - state.window.count
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self) -> RateSnapshot {
        let state = self.state.lock();
        RateSnapshot {
            name: self.name.clone(),
            window: state.window,
            window_ms: self.window_ms,
            denied: state.denied,
        }
    }
}
