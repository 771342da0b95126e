//! Clusterman - cluster monitor orchestration engine
//!
//! Coordinates updates to per-entity monitor records across a cluster and
//! waits for entities to converge on an orchestration's target state.
//!
//! # Modules
//!
//! - [`bus`] - In-process publish/subscribe event bus
//! - [`domain`] - Entities, monitor records and the patch protocol
//! - [`monitor`] - Per-entity workers, the update client and the local actuator
//! - [`orchestrate`] - Convergence waiter and target planning
//! - [`sse`] - Streaming event codec
//! - [`ipc`] - Unix socket protocol between the CLI and the daemon
//! - [`daemon`] - Daemon process wiring
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod bus;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod ipc;
pub mod monitor;
pub mod orchestrate;
pub mod sse;

pub use bus::{Bus, BusConfig, BusError, Filter, Kind, Labels, Msg, Subscription};
pub use config::Config;
pub use domain::{EntityRef, LocalExpect, MonitorPatch, MonitorRecord, MonitorState, ObjectPath, OrchestrationId};
pub use monitor::{MonitorClient, MonitorManager, MonitorStore, UpdateError};
pub use orchestrate::{ConvergenceWaiter, Orchestration, OrchestrationError, OrchestrationReport};
pub use sse::{CodecError, Decoder, Event};
