//! Bus message payloads
//!
//! Internal dispatch always matches on [`Msg`]. The only place a kind string
//! is turned back into a typed payload is [`Msg::from_wire`], used when
//! decoding the streaming wire format.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ConflictReason, EntityRef, LocalExpect, MonitorPatch, MonitorRecord, ObjectPath, OrchestrationId};
use crate::monitor::ReplySlot;

use super::types::{Kind, LABEL_ENTITY, LABEL_NODE, LABEL_PATH, Labels};

/// Proposed update of one entity's monitor record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMonitor {
    pub entity: EntityRef,
    pub patch: MonitorPatch,
    pub candidate: OrchestrationId,
    /// Answered exactly once by the entity's worker
    #[serde(skip)]
    pub reply: ReplySlot,
}

/// An update was refused by the entity's worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMonitorRefused {
    pub entity: EntityRef,
    pub candidate: OrchestrationId,
    pub reason: ConflictReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMonitorUpdated {
    pub path: ObjectPath,
    pub node: String,
    pub value: MonitorRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMonitorDeleted {
    pub path: ObjectPath,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMonitorUpdated {
    pub node: String,
    pub value: MonitorRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMonitorDeleted {
    pub node: String,
}

/// A multi-entity orchestration finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEnd {
    pub id: OrchestrationId,
    pub node: String,
    pub intent: LocalExpect,
    pub success: bool,
    pub reason: Option<String>,
}

/// Errors turning wire `(kind, data)` pairs back into messages
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: Kind,
        #[source]
        source: serde_json::Error,
    },
}

/// Every message the bus carries
#[derive(Debug, Clone)]
pub enum Msg {
    SetMonitor(SetMonitor),
    SetMonitorRefused(SetMonitorRefused),
    InstanceMonitorUpdated(InstanceMonitorUpdated),
    InstanceMonitorDeleted(InstanceMonitorDeleted),
    NodeMonitorUpdated(NodeMonitorUpdated),
    NodeMonitorDeleted(NodeMonitorDeleted),
    OrchestrationEnd(OrchestrationEnd),
}

impl Msg {
    /// `*MonitorUpdated` for the entity's kind
    pub fn updated(entity: &EntityRef, value: MonitorRecord) -> Msg {
        match entity {
            EntityRef::Instance { path, node } => Msg::InstanceMonitorUpdated(InstanceMonitorUpdated {
                path: path.clone(),
                node: node.clone(),
                value,
            }),
            EntityRef::Node(node) => Msg::NodeMonitorUpdated(NodeMonitorUpdated {
                node: node.clone(),
                value,
            }),
        }
    }

    /// `*MonitorDeleted` for the entity's kind
    pub fn deleted(entity: &EntityRef) -> Msg {
        match entity {
            EntityRef::Instance { path, node } => Msg::InstanceMonitorDeleted(InstanceMonitorDeleted {
                path: path.clone(),
                node: node.clone(),
            }),
            EntityRef::Node(node) => Msg::NodeMonitorDeleted(NodeMonitorDeleted { node: node.clone() }),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Msg::SetMonitor(_) => Kind::SetMonitor,
            Msg::SetMonitorRefused(_) => Kind::SetMonitorRefused,
            Msg::InstanceMonitorUpdated(_) => Kind::InstanceMonitorUpdated,
            Msg::InstanceMonitorDeleted(_) => Kind::InstanceMonitorDeleted,
            Msg::NodeMonitorUpdated(_) => Kind::NodeMonitorUpdated,
            Msg::NodeMonitorDeleted(_) => Kind::NodeMonitorDeleted,
            Msg::OrchestrationEnd(_) => Kind::OrchestrationEnd,
        }
    }

    /// Labels derived from the payload identity
    pub fn labels(&self) -> Labels {
        match self {
            Msg::SetMonitor(m) => request_labels(&m.entity),
            Msg::SetMonitorRefused(m) => request_labels(&m.entity),
            Msg::InstanceMonitorUpdated(m) => instance_labels(&m.path, &m.node),
            Msg::InstanceMonitorDeleted(m) => instance_labels(&m.path, &m.node),
            Msg::NodeMonitorUpdated(m) => Labels::new().with(LABEL_NODE, &m.node),
            Msg::NodeMonitorDeleted(m) => Labels::new().with(LABEL_NODE, &m.node),
            Msg::OrchestrationEnd(m) => Labels::new()
                .with(LABEL_NODE, &m.node)
                .with("orchestration", m.id.to_string()),
        }
    }

    /// Entity this message is about, if any
    pub fn entity(&self) -> Option<EntityRef> {
        match self {
            Msg::SetMonitor(m) => Some(m.entity.clone()),
            Msg::SetMonitorRefused(m) => Some(m.entity.clone()),
            Msg::InstanceMonitorUpdated(m) => Some(EntityRef::Instance {
                path: m.path.clone(),
                node: m.node.clone(),
            }),
            Msg::InstanceMonitorDeleted(m) => Some(EntityRef::Instance {
                path: m.path.clone(),
                node: m.node.clone(),
            }),
            Msg::NodeMonitorUpdated(m) => Some(EntityRef::Node(m.node.clone())),
            Msg::NodeMonitorDeleted(m) => Some(EntityRef::Node(m.node.clone())),
            Msg::OrchestrationEnd(_) => None,
        }
    }

    /// Monitor record carried by update messages
    pub fn record(&self) -> Option<&MonitorRecord> {
        match self {
            Msg::InstanceMonitorUpdated(m) => Some(&m.value),
            Msg::NodeMonitorUpdated(m) => Some(&m.value),
            _ => None,
        }
    }

    /// Serialize the payload as JSON
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Msg::SetMonitor(m) => serde_json::to_vec(m),
            Msg::SetMonitorRefused(m) => serde_json::to_vec(m),
            Msg::InstanceMonitorUpdated(m) => serde_json::to_vec(m),
            Msg::InstanceMonitorDeleted(m) => serde_json::to_vec(m),
            Msg::NodeMonitorUpdated(m) => serde_json::to_vec(m),
            Msg::NodeMonitorDeleted(m) => serde_json::to_vec(m),
            Msg::OrchestrationEnd(m) => serde_json::to_vec(m),
        }
    }

    /// Rebuild a message from its wire kind and JSON payload
    pub fn from_wire(kind: &str, data: &[u8]) -> Result<Msg, WireError> {
        let kind: Kind = kind.parse().map_err(|_| WireError::UnknownKind(kind.to_string()))?;
        let payload = |source| WireError::Payload { kind, source };
        let msg = match kind {
            Kind::SetMonitor => Msg::SetMonitor(serde_json::from_slice(data).map_err(payload)?),
            Kind::SetMonitorRefused => Msg::SetMonitorRefused(serde_json::from_slice(data).map_err(payload)?),
            Kind::InstanceMonitorUpdated => Msg::InstanceMonitorUpdated(serde_json::from_slice(data).map_err(payload)?),
            Kind::InstanceMonitorDeleted => Msg::InstanceMonitorDeleted(serde_json::from_slice(data).map_err(payload)?),
            Kind::NodeMonitorUpdated => Msg::NodeMonitorUpdated(serde_json::from_slice(data).map_err(payload)?),
            Kind::NodeMonitorDeleted => Msg::NodeMonitorDeleted(serde_json::from_slice(data).map_err(payload)?),
            Kind::OrchestrationEnd => Msg::OrchestrationEnd(serde_json::from_slice(data).map_err(payload)?),
        };
        Ok(msg)
    }
}

/// Requests also carry the full entity so a node's worker does not match its instances
fn request_labels(entity: &EntityRef) -> Labels {
    Labels::for_entity(entity).with(LABEL_ENTITY, entity.to_string())
}

fn instance_labels(path: &ObjectPath, node: &str) -> Labels {
    Labels::new().with(LABEL_PATH, path.to_string()).with(LABEL_NODE, node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updated(path: &str) -> Msg {
        Msg::InstanceMonitorUpdated(InstanceMonitorUpdated {
            path: path.parse().unwrap(),
            node: "node1".to_string(),
            value: MonitorRecord::new(),
        })
    }

    #[test]
    fn test_labels_follow_payload() {
        let msg = updated("ns1/svc/app1");
        assert_eq!(msg.kind(), Kind::InstanceMonitorUpdated);
        let labels = msg.labels();
        assert_eq!(labels.get(LABEL_PATH), Some("ns1/svc/app1"));
        assert_eq!(labels.get(LABEL_NODE), Some("node1"));
        assert_eq!(msg.entity().unwrap().to_string(), "ns1/svc/app1@node1");
    }

    #[test]
    fn test_from_wire_restores_payload() {
        let msg = updated("ns1/vol/data");
        let json = msg.to_json().unwrap();
        match Msg::from_wire("InstanceMonitorUpdated", &json).unwrap() {
            Msg::InstanceMonitorUpdated(m) => {
                assert_eq!(m.path.to_string(), "ns1/vol/data");
                assert_eq!(m.value.state, crate::domain::MonitorState::Idle);
            }
            other => panic!("Expected InstanceMonitorUpdated, got {:?}", other),
        }
    }

    #[test]
    fn test_from_wire_errors() {
        assert!(matches!(
            Msg::from_wire("Nope", b"{}"),
            Err(WireError::UnknownKind(k)) if k == "Nope"
        ));
        assert!(matches!(
            Msg::from_wire("NodeMonitorDeleted", b"{"),
            Err(WireError::Payload {
                kind: Kind::NodeMonitorDeleted,
                ..
            })
        ));
    }

    #[test]
    fn test_updated_follows_entity_kind() {
        let node: EntityRef = "node1".parse().unwrap();
        assert_eq!(Msg::updated(&node, MonitorRecord::new()).kind(), Kind::NodeMonitorUpdated);
        assert_eq!(Msg::deleted(&node).kind(), Kind::NodeMonitorDeleted);

        let instance: EntityRef = "ns1/svc/app1@node1".parse().unwrap();
        let msg = Msg::updated(&instance, MonitorRecord::new());
        assert_eq!(msg.kind(), Kind::InstanceMonitorUpdated);
        assert!(msg.record().is_some());
        assert_eq!(msg.entity(), Some(instance));
    }

    #[test]
    fn test_set_monitor_reply_is_not_serialized() {
        let msg = Msg::SetMonitor(SetMonitor {
            entity: "node1".parse().unwrap(),
            patch: MonitorPatch::new().local_expect(LocalExpect::Freeze),
            candidate: OrchestrationId::new(),
            reply: ReplySlot::default(),
        });
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(!json.contains("reply"));
        assert!(Msg::from_wire("SetMonitor", json.as_bytes()).is_ok());
    }
}
