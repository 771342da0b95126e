//! Monitor update protocol
//!
//! Every declared entity gets a [`MonitorRecord`](crate::domain::MonitorRecord)
//! in the shared [`MonitorStore`] and a worker task that is its only writer.
//! Callers propose patches through [`MonitorClient::request_update`]; the
//! request travels over the bus to the worker and the outcome comes back
//! through a one-shot reply slot.

mod actuator;
mod client;
mod config;
mod manager;
mod messages;
mod store;
mod worker;

pub use actuator::Actuator;
pub use client::MonitorClient;
pub use config::{ActuatorConfig, MonitorConfig};
pub use manager::MonitorManager;
pub use messages::{MonitorError, ReplySlot, UpdateError, UpdateResult};
pub use store::MonitorStore;
