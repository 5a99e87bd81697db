//! Infrastructure adapters for work item storage and heartbeat mirrors.

pub mod heartbeat;
pub mod store;

pub use heartbeat::{InMemoryHeartbeatSink, JsonlHeartbeatSink};
pub use store::{InMemoryWorkItemStore, JsonlWorkItemStore};
