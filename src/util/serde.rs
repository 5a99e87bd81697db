//! Serializable identifier and priority types shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a pooled automation session.
pub type SessionId = u64;

/// Identifier of a durable work item.
pub type WorkItemId = u64;

/// Pool acquisition priority. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Publishing queued content. Always served before anything else.
    pub const PUBLISH: Self = Self(0);
    /// Replies and other engagement actions.
    pub const ENGAGEMENT: Self = Self(3);
    /// Scraping, metrics collection, opportunity harvesting.
    pub const BACKGROUND: Self = Self(5);
    /// Health checks and housekeeping.
    pub const MAINTENANCE: Self = Self(8);

    /// Raw numeric value.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::BACKGROUND
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}
