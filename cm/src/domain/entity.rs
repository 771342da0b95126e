//! Entity references
//!
//! An entity is the addressable unit of monitor state: a node, or an object
//! instance on a node. Instances are written `<path>@<node>`, nodes by name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::path::{ObjectPath, PathError, validate_name};

/// Identifies a node or an object instance on a node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityRef {
    /// An object instance hosted on a node
    Instance { path: ObjectPath, node: String },
    /// A cluster node
    Node(String),
}

impl EntityRef {
    /// Reference an object instance, validating the node name
    pub fn instance(path: ObjectPath, node: &str) -> Result<Self, PathError> {
        validate_name(node)?;
        Ok(Self::Instance {
            path,
            node: node.to_string(),
        })
    }

    /// Reference a node, validating its name
    pub fn node(name: &str) -> Result<Self, PathError> {
        validate_name(name)?;
        Ok(Self::Node(name.to_string()))
    }

    /// Node hosting this entity (the node itself for node entities)
    pub fn node_name(&self) -> &str {
        match self {
            Self::Instance { node, .. } => node,
            Self::Node(node) => node,
        }
    }

    /// Object path for instance entities
    pub fn path(&self) -> Option<&ObjectPath> {
        match self {
            Self::Instance { path, .. } => Some(path),
            Self::Node(_) => None,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Self::Node(_))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance { path, node } => write!(f, "{}@{}", path, node),
            Self::Node(node) => f.write_str(node),
        }
    }
}

impl FromStr for EntityRef {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((path, node)) => Self::instance(path.parse()?, node),
            None if s.is_empty() => Err(PathError::Empty),
            None => Self::node(s),
        }
    }
}

impl TryFrom<String> for EntityRef {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityRef> for String {
    fn from(entity: EntityRef) -> Self {
        entity.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_roundtrip() {
        let entity: EntityRef = "ns1/svc/app1@node1".parse().unwrap();
        assert_eq!(entity.node_name(), "node1");
        assert_eq!(entity.path().unwrap().to_string(), "ns1/svc/app1");
        assert_eq!(entity.to_string(), "ns1/svc/app1@node1");
        assert!(!entity.is_node());
    }

    #[test]
    fn test_node_entity() {
        let entity: EntityRef = "node2".parse().unwrap();
        assert_eq!(entity, EntityRef::Node("node2".to_string()));
        assert!(entity.is_node());
        assert!(entity.path().is_none());
    }

    #[test]
    fn test_invalid_entities() {
        assert!("".parse::<EntityRef>().is_err());
        assert!("app1@".parse::<EntityRef>().is_err());
        assert!("app1@Node_1".parse::<EntityRef>().is_err());
    }

    #[test]
    fn test_equality_and_ordering() {
        let a: EntityRef = "app1@n1".parse().unwrap();
        let b: EntityRef = "root/svc/app1@n1".parse().unwrap();
        let c: EntityRef = "app1@n2".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }
}
