//! Multi-entity orchestrations
//!
//! [`ConvergenceWaiter`] applies one local intent to many entities under a
//! shared orchestration id and waits until all of them reach the intent's
//! terminal state, reverting on partial failure.

mod config;
mod plan;
mod waiter;
mod waitset;

pub use config::OrchestrationConfig;
pub use plan::plan_targets;
pub use waiter::{ConvergenceWaiter, Orchestration, OrchestrationError, OrchestrationReport};
pub use waitset::{Observation, WaitSet};
