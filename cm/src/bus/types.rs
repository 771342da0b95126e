//! Bus routing types: message kinds, labels and subscription filters

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::EntityRef;

use super::msg::Msg;

/// Label carrying an object path
pub const LABEL_PATH: &str = "path";
/// Label carrying a node name
pub const LABEL_NODE: &str = "node";
/// Label carrying the full entity reference of a request
pub const LABEL_ENTITY: &str = "entity";

/// Tag naming the payload schema of a bus message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    SetMonitor,
    SetMonitorRefused,
    InstanceMonitorUpdated,
    InstanceMonitorDeleted,
    NodeMonitorUpdated,
    NodeMonitorDeleted,
    OrchestrationEnd,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Self::SetMonitor,
        Self::SetMonitorRefused,
        Self::InstanceMonitorUpdated,
        Self::InstanceMonitorDeleted,
        Self::NodeMonitorUpdated,
        Self::NodeMonitorDeleted,
        Self::OrchestrationEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetMonitor => "SetMonitor",
            Self::SetMonitorRefused => "SetMonitorRefused",
            Self::InstanceMonitorUpdated => "InstanceMonitorUpdated",
            Self::InstanceMonitorDeleted => "InstanceMonitorDeleted",
            Self::NodeMonitorUpdated => "NodeMonitorUpdated",
            Self::NodeMonitorDeleted => "NodeMonitorDeleted",
            Self::OrchestrationEnd => "OrchestrationEnd",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event kind '{}'", s))
    }
}

/// Routing labels attached to a published message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Identity labels of an entity: `path` and `node` for instances, `node` for nodes
    pub fn for_entity(entity: &EntityRef) -> Self {
        match entity {
            EntityRef::Instance { path, node } => Self::new().with(LABEL_PATH, path.to_string()).with(LABEL_NODE, node),
            EntityRef::Node(node) => Self::new().with(LABEL_NODE, node),
        }
    }

    /// Every label of `other` is present here with the same value
    pub fn contains_all(&self, other: &Labels) -> bool {
        other.0.iter().all(|(key, value)| self.0.get(key) == Some(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Labels {
    type Err = String;

    /// Parse `k=v[,k=v...]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = Labels::new();
        for pair in s.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("label '{}' is not key=value", pair))?;
            if key.is_empty() {
                return Err(format!("label '{}' has an empty key", pair));
            }
            labels.insert(key, value);
        }
        Ok(labels)
    }
}

/// One subscription filter entry: a kind (or any) and labels that must all match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// `None` matches any kind
    pub kind: Option<Kind>,
    #[serde(default)]
    pub labels: Labels,
}

impl Filter {
    pub fn new(kind: Option<Kind>, labels: Labels) -> Self {
        Self { kind, labels }
    }

    pub fn kind(kind: Kind) -> Self {
        Self::new(Some(kind), Labels::new())
    }

    pub fn matches(&self, kind: Kind, labels: &Labels) -> bool {
        self.kind.is_none_or(|k| k == kind) && labels.contains_all(&self.labels)
    }
}

/// Identifier of a registered subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A message as delivered to one subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Bus-wide publish sequence number, strictly increasing per subscription
    pub seq: u64,
    /// Time the dispatcher accepted the message
    pub time: DateTime<Utc>,
    pub msg: Arc<Msg>,
    pub labels: Arc<Labels>,
}
