//! # Publish Orchestrator
//!
//! Reliability and scheduling layer for a process that performs externally
//! visible actions (publishing posts) through a small number of expensive
//! automation sessions.
//!
//! ## Core Problem Solved
//!
//! Many periodic jobs compete for a handful of browser-like sessions, and the
//! external surface they talk to degrades, rate-limits, and occasionally
//! swallows responses. This crate keeps that under control:
//!
//! - **Session pool**: bounded capacity, strict priority hand-off (publishing
//!   first), lazy creation, recycling, and a watchdog for leaked leases
//! - **Circuit breakers**: one per failure domain, fail fast while open
//! - **Rate limiters**: rolling-window admission per action class
//! - **Job scheduler**: staggered periodic jobs with heartbeats, overlap
//!   skipping, failure isolation, and stall reporting
//! - **Queue processor**: drives work items `Queued -> InProgress -> Done/Failed`
//!   with conditional (compare-and-swap) status updates
//! - **Recovery sweeper**: reconciles items stuck in progress, including
//!   actions that succeeded without the response ever arriving
//!
//! ## Assembly
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use publish_orchestrator::builders::Orchestrator;
//! use publish_orchestrator::config::OrchestratorConfig;
//! use publish_orchestrator::infra::InMemoryWorkItemStore;
//! use publish_orchestrator::runtime::TokioSpawner;
//!
//! let config = OrchestratorConfig::from_env()?;
//! let orchestrator = Orchestrator::builder(config).build(
//!     MyBrowserProvider::new(),
//!     Arc::new(InMemoryWorkItemStore::<Post>::new()),
//!     Arc::new(MyPublisher::new()),
//!     TokioSpawner::current()?,
//! )?;
//! orchestrator.register_job("metrics-harvest", Arc::new(MetricsHarvest::new()))?;
//! orchestrator.start()?;
//!
//! let report = orchestrator.status().await?;
//! println!("{}", report.to_json()?);
//! ```
//!
//! For complete scenarios, see the integration tests under `tests/`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Pool, breaker, limiter, scheduler, and the work item state machine.
pub mod core;
/// Configuration models and loading.
pub mod config;
/// Builders to assemble the orchestrator from configuration.
pub mod builders;
/// Infrastructure adapters for work item storage and heartbeat mirrors.
pub mod infra;
/// Runtime adapters and the status API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
