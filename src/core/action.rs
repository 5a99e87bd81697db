//! External action collaborator and payload abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::ActionError;

/// Marker trait for work item payloads.
///
/// Payloads are cloned out of storage and shared across tasks, so they must be
/// `Clone + Send + Sync`.
pub trait WorkPayload: Clone + Send + Sync + 'static {}

/// Blanket implementation: any type meeting the requirements is a `WorkPayload`.
impl<T> WorkPayload for T where T: Clone + Send + Sync + 'static {}

/// Successful action result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    /// Identifier of the created artifact, if the surface returned one.
    pub external_ref: Option<String>,
}

impl ActionReceipt {
    /// Receipt carrying an external reference.
    pub fn with_ref(external_ref: impl Into<String>) -> Self {
        Self {
            external_ref: Some(external_ref.into()),
        }
    }
}

/// Key used to ask the external surface whether an action happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Lookup {
    /// Known reference of the artifact.
    ExternalRef(String),
    /// Content-derived key when no reference was captured.
    SearchKey(String),
}

/// Answer to a [`Lookup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Whether the artifact exists.
    pub found: bool,
    /// Its reference, when found.
    pub external_ref: Option<String>,
}

impl Verification {
    /// The artifact exists under `external_ref`.
    pub fn found(external_ref: impl Into<String>) -> Self {
        Self {
            found: true,
            external_ref: Some(external_ref.into()),
        }
    }

    /// The artifact does not exist.
    pub const fn missing() -> Self {
        Self {
            found: false,
            external_ref: None,
        }
    }
}

/// The externally visible action performed for each work item.
///
/// `perform` runs with an exclusively leased session. `verify` is read-only
/// and is used by the recovery sweeper to reconcile items whose outcome was
/// never observed.
#[async_trait]
pub trait PublishAction<P, S>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
    S: Send + 'static,
{
    /// Perform the action for `payload` using `session`.
    async fn perform(&self, payload: &P, session: &mut S) -> Result<ActionReceipt, ActionError>;

    /// Ask whether the artifact identified by `lookup` exists.
    async fn verify(&self, lookup: &Lookup) -> Result<Verification, ActionError>;

    /// Content-derived key for items that never captured an external reference.
    fn search_key(&self, _payload: &P) -> Option<String> {
        None
    }
}
