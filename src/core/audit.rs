//! Audit sink implementations.
//!
//! Every work item status transition and every circuit breaker state change is
//! written here so operators can reconstruct what the orchestrator did.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Component that emitted the event (`queue-processor`, `recovery-sweeper`, `breaker:publish`, ...).
    pub component: String,
    /// Subject of the event: a work item id or breaker name.
    pub subject: String,
    /// Action taken (`in_progress`, `done`, `requeued`, `failed`, `stuck`, `circuit_open`, ...).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// Shared handle to an audit sink.
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// In-memory audit sink for testing and dev. Clones share the same buffer.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(1024)))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events whose action matches `action`.
    pub fn with_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    component: impl Into<String>,
    subject: impl Into<String>,
    action: impl Into<String>,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        component: component.into(),
        subject: subject.into(),
        action: action.into(),
        created_at_ms: now_ms(),
        detail,
    }
}

/// Record an event on an optional sink.
pub(crate) fn record(
    sink: Option<&SharedAuditSink>,
    component: &str,
    subject: impl Into<String>,
    action: &str,
    detail: Option<String>,
) {
    if let Some(sink) = sink {
        sink.record(build_audit_event(component, subject, action, detail));
    }
}
