//! Orchestration configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrchestrationConfig {
    /// Default bound on a whole orchestration
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Timeout of each best-effort revert request
    #[serde(default = "default_revert_timeout_ms")]
    pub revert_timeout_ms: u64,
}

fn default_deadline_ms() -> u64 {
    debug!("default_deadline_ms: called");
    30_000
}

fn default_revert_timeout_ms() -> u64 {
    debug!("default_revert_timeout_ms: called");
    2000
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            revert_timeout_ms: default_revert_timeout_ms(),
        }
    }
}

impl OrchestrationConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn revert_timeout(&self) -> Duration {
        Duration::from_millis(self.revert_timeout_ms)
    }
}
