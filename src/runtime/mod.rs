//! Runtime adapters and the status API surface.

pub mod api;
pub mod tokio_spawner;

pub use api::{health, Health, StatusReport};
pub use tokio_spawner::TokioSpawner;
