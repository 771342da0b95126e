//! Bus errors

use std::time::Duration;

use thiserror::Error;

/// Errors from bus operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,

    #[error("Publish not accepted within {0:?}")]
    PublishTimeout(Duration),

    #[error("Subscription '{name}' could not be allocated within {after:?}")]
    AllocTimeout { name: String, after: Duration },

    #[error("Subscriber limit of {limit} reached")]
    TooManySubscribers { limit: usize },

    #[error("Subscription '{0}' already started")]
    AlreadyStarted(String),

    #[error("Subscription '{0}' is stopped")]
    Stopped(String),
}
