//! Monitor protocol errors and the one-shot reply slot

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::bus::BusError;
use crate::domain::{ConflictReason, EntityRef, OrchestrationId, ValidationError};

/// Outcome of one update request
pub type UpdateResult = Result<OrchestrationId, UpdateError>;

/// Why an update request did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("Invalid patch: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown entity {0}")]
    NotFound(EntityRef),

    #[error("Conflict: {0}")]
    Conflict(ConflictReason),

    #[error("No reply for {entity} within {after:?}")]
    Timeout { entity: EntityRef, after: Duration },

    #[error("Update of {0} canceled")]
    Canceled(EntityRef),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl UpdateError {
    /// HTTP-style status code for this outcome
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Timeout { .. } => 408,
            Self::Conflict(_) => 409,
            Self::Canceled(_) => 499,
            Self::Unavailable(_) => 503,
        }
    }
}

impl From<BusError> for UpdateError {
    fn from(e: BusError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Errors from declaring and forgetting entities
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("Entity {0} is already declared")]
    AlreadyDeclared(EntityRef),

    #[error("Unknown entity {0}")]
    NotFound(EntityRef),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl MonitorError {
    pub fn status(&self) -> u16 {
        match self {
            Self::AlreadyDeclared(_) => 409,
            Self::NotFound(_) => 404,
            Self::Bus(_) => 503,
        }
    }
}

/// Single-use reply channel carried inside a `SetMonitor` message
///
/// Cloning shares the slot; the first `send` wins. When every clone is
/// dropped without a reply the waiting caller observes a closed channel.
#[derive(Clone, Default)]
pub struct ReplySlot(Arc<Mutex<Option<oneshot::Sender<UpdateResult>>>>);

impl ReplySlot {
    pub fn new() -> (Self, oneshot::Receiver<UpdateResult>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    fn take(&self) -> Option<oneshot::Sender<UpdateResult>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Deliver the result; returns false if already answered or nobody is waiting
    pub fn send(&self, result: UpdateResult) -> bool {
        match self.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySlot")
            .field("answered", &self.is_answered())
            .finish()
    }
}
