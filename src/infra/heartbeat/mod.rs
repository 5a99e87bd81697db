//! Heartbeat mirror backends.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlHeartbeatSink;
pub use memory::InMemoryHeartbeatSink;
