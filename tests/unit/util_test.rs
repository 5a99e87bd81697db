//! Tests for utility functions

use std::time::Duration;

use publish_orchestrator::util::{Clock, ManualClock, Priority, SessionId, WorkItemId};

#[test]
fn test_priority_ordering() {
    assert!(Priority::PUBLISH < Priority::ENGAGEMENT);
    assert!(Priority::ENGAGEMENT < Priority::BACKGROUND);
    assert!(Priority::BACKGROUND < Priority::MAINTENANCE);
    assert_eq!(Priority::default(), Priority::BACKGROUND);
}

#[test]
fn test_priority_serializes_as_number() {
    assert_eq!(serde_json::to_string(&Priority::ENGAGEMENT).unwrap(), "3");
    let parsed: Priority = serde_json::from_str("7").unwrap();
    assert_eq!(parsed, Priority(7));
    assert_eq!(Priority(7).to_string(), "p7");
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(1_000);
    let shared = clock.shared();
    clock.advance(Duration::from_millis(250));
    assert_eq!(shared.now_ms(), 1_250);
    clock.set(5_000);
    assert_eq!(shared.now_ms(), 5_000);
}

#[test]
fn test_ids() {
    let session: SessionId = 12;
    let item: WorkItemId = 12345;
    assert_eq!(session, 12);
    assert_eq!(item, 12345);
}
