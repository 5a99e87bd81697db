//! Read-only status surface for external monitoring.

use serde::{Deserialize, Serialize};

use crate::core::{
    BreakerSnapshot, CircuitState, JobDescriptor, PoolHealth, ProcessorStats, RateSnapshot,
    StallReport, StatusCounts,
};

/// Everything an operator needs to see in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// When the report was assembled (ms since epoch).
    pub generated_at_ms: u128,
    /// Job heartbeats and counters.
    pub jobs: Vec<JobDescriptor>,
    /// Jobs currently violating liveness.
    pub stalled: Vec<StallReport>,
    /// Breaker states.
    pub breakers: Vec<BreakerSnapshot>,
    /// Rate windows.
    pub rate_limits: Vec<RateSnapshot>,
    /// Session pool health.
    pub pool: PoolHealth,
    /// Queue processor counters.
    pub queue: ProcessorStats,
    /// Work items per status.
    pub work_items: StatusCounts,
}

impl StatusReport {
    /// Serialize as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Breakers that are not closed.
    pub open_breakers: Vec<String>,
    /// Stalled jobs.
    pub stalled_jobs: Vec<String>,
}

/// Derive health from a status report: unhealthy while any breaker is open
/// or any job is stalled. A half-open breaker is reported but not unhealthy.
pub fn health(report: &StatusReport) -> Health {
    let open_breakers: Vec<String> = report
        .breakers
        .iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| b.name.clone())
        .collect();
    let stalled_jobs: Vec<String> = report.stalled.iter().map(|s| s.job.clone()).collect();
    let any_open = report.breakers.iter().any(|b| b.state == CircuitState::Open);
    Health {
        ok: !any_open && stalled_jobs.is_empty(),
        open_breakers,
        stalled_jobs,
    }
}
