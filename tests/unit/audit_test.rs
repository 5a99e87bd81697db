//! Tests for audit sink

use publish_orchestrator::core::{build_audit_event, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("queue-processor", "42", "done", Some("ext-42".to_string()));
    sink.record(event);
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].component, "queue-processor");
    assert_eq!(events[0].subject, "42");
    assert_eq!(events[0].action, "done");
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("queue-processor", "1", "in_progress", None));
    sink.record(build_audit_event("queue-processor", "2", "in_progress", None));
    sink.record(build_audit_event("queue-processor", "3", "in_progress", None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject, "2"); // First one popped
    assert_eq!(events[1].subject, "3");
}

#[test]
fn test_clones_share_the_buffer() {
    let sink = InMemoryAuditSink::new(8);
    let handle = sink.clone();
    handle.record(build_audit_event("breaker:publish", "publish", "circuit_open", None));
    handle.record(build_audit_event("recovery-sweeper", "7", "recovered", None));

    assert_eq!(sink.events().len(), 2);
    assert_eq!(sink.with_action("recovered")[0].subject, "7");
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event("recovery-sweeper", "9", "stuck", Some("no outcome".to_string()));

    assert_eq!(event.component, "recovery-sweeper");
    assert_eq!(event.subject, "9");
    assert_eq!(event.action, "stuck");
    assert_eq!(event.detail, Some("no outcome".to_string()));
    assert!(uuid::Uuid::parse_str(&event.event_id).is_ok());
    assert!(event.created_at_ms > 0);
}
