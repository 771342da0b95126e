//! Target selection for node-level intents

use tracing::debug;

use crate::domain::{EntityRef, LocalExpect, ObjectPath};
use crate::monitor::MonitorStore;

/// Entities an intent issued on `node` applies to
///
/// Explicit paths select those instances on the node. Without paths, node
/// intents (freeze, thaw) target the node record itself and the others
/// target every instance hosted on the node.
pub fn plan_targets(store: &MonitorStore, node: &str, intent: LocalExpect, paths: &[ObjectPath]) -> Vec<EntityRef> {
    debug!(%node, %intent, paths = paths.len(), "plan_targets: called");
    if !paths.is_empty() {
        return paths
            .iter()
            .map(|path| EntityRef::Instance {
                path: path.clone(),
                node: node.to_string(),
            })
            .collect();
    }
    if intent.applies_to_node() && intent != LocalExpect::Shutdown {
        return vec![EntityRef::Node(node.to_string())];
    }
    store.instances_on(node)
}
