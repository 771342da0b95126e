//! Bus configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BusConfig {
    /// Capacity of the dispatcher's ingress queue
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// Default delivery queue capacity per subscription
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// How long `publish` waits for room on the ingress queue
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// How long `subscribe` waits for the dispatcher to allocate a subscriber
    #[serde(default = "default_alloc_timeout_ms")]
    pub alloc_timeout_ms: u64,

    /// How long the dispatcher waits on a full blocking subscriber
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Upper bound on live subscriptions
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,
}

fn default_ingress_capacity() -> usize {
    debug!("default_ingress_capacity: called");
    4096
}

fn default_subscriber_capacity() -> usize {
    debug!("default_subscriber_capacity: called");
    1024
}

fn default_publish_timeout_ms() -> u64 {
    debug!("default_publish_timeout_ms: called");
    1000
}

fn default_alloc_timeout_ms() -> u64 {
    debug!("default_alloc_timeout_ms: called");
    1000
}

fn default_block_timeout_ms() -> u64 {
    debug!("default_block_timeout_ms: called");
    200
}

fn default_max_subscribers() -> usize {
    debug!("default_max_subscribers: called");
    4096
}

impl Default for BusConfig {
    fn default() -> Self {
        debug!("BusConfig::default: called");
        Self {
            ingress_capacity: default_ingress_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            alloc_timeout_ms: default_alloc_timeout_ms(),
            block_timeout_ms: default_block_timeout_ms(),
            max_subscribers: default_max_subscribers(),
        }
    }
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn alloc_timeout(&self) -> Duration {
        Duration::from_millis(self.alloc_timeout_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.ingress_capacity, 4096);
        assert_eq!(config.subscriber_capacity, 1024);
        assert_eq!(config.max_subscribers, 4096);
        assert_eq!(config.publish_timeout(), Duration::from_secs(1));
        assert_eq!(config.block_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_partial_yaml() {
        let config: BusConfig = serde_yaml::from_str("max-subscribers: 8\nblock-timeout-ms: 5\n").unwrap();
        assert_eq!(config.max_subscribers, 8);
        assert_eq!(config.block_timeout(), Duration::from_millis(5));
        assert_eq!(config.subscriber_capacity, 1024);
    }
}
