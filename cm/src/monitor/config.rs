//! Monitor and actuator configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Monitor update protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorConfig {
    /// Default timeout for one update request
    #[serde(default = "default_update_timeout_ms")]
    pub update_timeout_ms: u64,

    /// Delivery queue capacity of each entity worker
    #[serde(default = "default_worker_queue")]
    pub worker_queue: usize,
}

fn default_update_timeout_ms() -> u64 {
    debug!("default_update_timeout_ms: called");
    5000
}

fn default_worker_queue() -> usize {
    debug!("default_worker_queue: called");
    64
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            update_timeout_ms: default_update_timeout_ms(),
            worker_queue: default_worker_queue(),
        }
    }
}

impl MonitorConfig {
    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }
}

/// Simulated local driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActuatorConfig {
    #[serde(default = "default_actuator_enabled")]
    pub enabled: bool,

    /// Time spent in the transitional state
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// Object paths (or node names) whose actions always fail
    #[serde(default)]
    pub fail_paths: Vec<String>,
}

fn default_actuator_enabled() -> bool {
    debug!("default_actuator_enabled: called");
    true
}

fn default_step_delay_ms() -> u64 {
    debug!("default_step_delay_ms: called");
    100
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            enabled: default_actuator_enabled(),
            step_delay_ms: default_step_delay_ms(),
            fail_paths: Vec::new(),
        }
    }
}

impl ActuatorConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}
