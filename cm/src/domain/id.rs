//! Orchestration identifiers
//!
//! Orchestration IDs correlate every update issued on behalf of one intent.
//! They are UUID v7, so they sort by creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifier for one orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrchestrationId(Uuid);

impl OrchestrationId {
    /// Generate a new, time-ordered orchestration ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Short form for log lines and CLI output (first 8 hex chars)
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for OrchestrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrchestrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrchestrationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = OrchestrationId::new();
        let b = OrchestrationId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = OrchestrationId::new();
        let parsed: OrchestrationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 8);
        assert!("not-a-uuid".parse::<OrchestrationId>().is_err());
    }
}
