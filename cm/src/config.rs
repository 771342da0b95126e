//! Clusterman configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::BusConfig;
use crate::ipc::get_socket_path;
use crate::monitor::{ActuatorConfig, MonitorConfig};
use crate::orchestrate::OrchestrationConfig;
use crate::sse::DEFAULT_MAX_RECORD_SIZE;

/// Main clusterman configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Name of the node this daemon runs on
    pub node_name: String,

    /// Log level, overridden by `--log-level`
    pub log_level: Option<String>,

    pub bus: BusConfig,

    pub monitor: MonitorConfig,

    pub orchestration: OrchestrationConfig,

    /// Event stream configuration
    pub stream: StreamConfig,

    /// Simulated local actuator
    pub actuator: ActuatorConfig,

    pub ipc: IpcConfig,
}

fn default_node_name() -> String {
    debug!("default_node_name: called");
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            log_level: None,
            bus: BusConfig::default(),
            monitor: MonitorConfig::default(),
            orchestration: OrchestrationConfig::default(),
            stream: StreamConfig::default(),
            actuator: ActuatorConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.clusterman.yml`, then
    /// `~/.config/clusterman/clusterman.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".clusterman.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("clusterman").join("clusterman.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Log level from the config file, read before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|config| config.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Event stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    /// Largest record a decoder accepts
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,

    /// Idle interval between heartbeat comments; 0 disables them
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_max_record_size() -> usize {
    debug!("default_max_record_size: called");
    DEFAULT_MAX_RECORD_SIZE
}

fn default_heartbeat_ms() -> u64 {
    debug!("default_heartbeat_ms: called");
    15_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_record_size: default_max_record_size(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_ms > 0).then(|| Duration::from_millis(self.heartbeat_ms))
    }
}

/// IPC configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    debug!("default_socket_path: called");
    get_socket_path()
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}
