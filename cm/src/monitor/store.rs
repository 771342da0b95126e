//! Shared snapshot table of monitor records
//!
//! Workers write their own entry; everyone else reads copies.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::domain::{EntityRef, MonitorRecord};

#[derive(Debug, Clone, Default)]
pub struct MonitorStore {
    records: Arc<RwLock<HashMap<EntityRef, MonitorRecord>>>,
}

impl MonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EntityRef, MonitorRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EntityRef, MonitorRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current record
    pub fn get(&self, entity: &EntityRef) -> Option<MonitorRecord> {
        self.read().get(entity).cloned()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.read().contains_key(entity)
    }

    pub(crate) fn put(&self, entity: EntityRef, record: MonitorRecord) {
        debug!(%entity, state = %record.state, "MonitorStore::put: called");
        self.write().insert(entity, record);
    }

    pub(crate) fn remove(&self, entity: &EntityRef) -> Option<MonitorRecord> {
        debug!(%entity, "MonitorStore::remove: called");
        self.write().remove(entity)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All records, sorted by entity
    pub fn snapshot(&self) -> Vec<(EntityRef, MonitorRecord)> {
        let mut records: Vec<_> = self.read().iter().map(|(e, r)| (e.clone(), r.clone())).collect();
        records.sort_by_key(|(entity, _)| entity.to_string());
        records
    }

    /// Instance entities hosted on `node`, sorted
    pub fn instances_on(&self, node: &str) -> Vec<EntityRef> {
        let mut entities: Vec<_> = self
            .read()
            .keys()
            .filter(|e| !e.is_node() && e.node_name() == node)
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.to_string());
        entities
    }

    /// Declared node entities, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self
            .read()
            .keys()
            .filter(|e| e.is_node())
            .map(|e| e.node_name().to_string())
            .collect();
        nodes.sort();
        nodes
    }
}
