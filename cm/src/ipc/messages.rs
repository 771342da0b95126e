//! IPC message types for daemon communication
//!
//! Each message is a single line of JSON followed by `\n`.

use serde::{Deserialize, Serialize};

use crate::bus::{BusMetrics, Filter};
use crate::domain::{EntityRef, LocalExpect, MonitorPatch, MonitorRecord, ObjectPath, OrchestrationId};
use crate::orchestrate::OrchestrationReport;

/// Requests from the CLI to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Ping to check if daemon is alive
    Ping,

    /// Request daemon to stop gracefully
    Shutdown,

    /// Start monitoring an entity
    Declare { entity: EntityRef },

    /// Stop monitoring an entity
    Forget { entity: EntityRef },

    /// Snapshot of every monitor record
    List,

    /// Bus counters
    Metrics,

    /// Propose a monitor update
    SetMonitor {
        entity: EntityRef,
        patch: MonitorPatch,
        /// A fresh id is allocated when absent
        #[serde(default)]
        orchestration_id: Option<OrchestrationId>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Run an orchestration on the daemon's node and wait for convergence
    Orchestrate {
        intent: LocalExpect,
        #[serde(default)]
        paths: Vec<ObjectPath>,
        #[serde(default)]
        deadline_ms: Option<u64>,
    },

    /// Switch the connection to an event stream
    Events {
        #[serde(default)]
        filters: Vec<Filter>,
        #[serde(default)]
        limit: Option<u64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
}

/// One row of a `List` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordEntry {
    pub entity: EntityRef,
    pub record: MonitorRecord,
}

/// Responses from the daemon to the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    /// Acknowledgment
    Ok,

    /// Pong response to ping
    Pong { version: String, node: String },

    /// Error with an HTTP-style status code
    Error { status: u16, message: String },

    /// Record of a newly declared entity
    Declared { entity: EntityRef, record: MonitorRecord },

    Records { records: Vec<RecordEntry> },

    Metrics { metrics: BusMetrics },

    /// Update accepted under this id
    Updated { orchestration_id: OrchestrationId },

    Orchestrated { report: OrchestrationReport },

    /// Event records follow on this connection
    Streaming,
}

impl DaemonResponse {
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::Error {
            status,
            message: message.into(),
        }
    }
}
