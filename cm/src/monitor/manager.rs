//! MonitorManager - owns the entity workers
//!
//! `declare` creates a record and its worker, `forget` and `node_left` tear
//! them down. The worker map lock is only held to insert or remove.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Kind, LABEL_ENTITY, Labels, Msg, QueueFullPolicy, SubscriptionOptions};
use crate::domain::{EntityRef, MonitorRecord};

use super::client::MonitorClient;
use super::config::MonitorConfig;
use super::messages::MonitorError;
use super::store::MonitorStore;
use super::worker::Worker;

struct WorkerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Handle to the set of entity workers
#[derive(Clone)]
pub struct MonitorManager {
    bus: Bus,
    store: MonitorStore,
    config: MonitorConfig,
    workers: Arc<Mutex<HashMap<EntityRef, WorkerHandle>>>,
}

impl MonitorManager {
    pub fn new(bus: Bus, store: MonitorStore, config: MonitorConfig) -> Self {
        debug!(?config, "MonitorManager::new: called");
        Self {
            bus,
            store,
            config,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<EntityRef, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &MonitorStore {
        &self.store
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Client issuing update requests against this manager's entities
    pub fn client(&self) -> MonitorClient {
        MonitorClient::new(self.bus.clone(), self.store.clone(), self.config.update_timeout())
    }

    pub fn is_declared(&self, entity: &EntityRef) -> bool {
        self.workers().contains_key(entity)
    }

    /// Create the record and worker for a newly observed entity
    pub async fn declare(&self, entity: EntityRef) -> Result<MonitorRecord, MonitorError> {
        debug!(%entity, "MonitorManager::declare: called");
        if self.is_declared(&entity) {
            return Err(MonitorError::AlreadyDeclared(entity));
        }

        // Started before the worker is reachable so no request can be missed
        let options = SubscriptionOptions::from_config(self.bus.config())
            .capacity(self.config.worker_queue)
            .policy(QueueFullPolicy::Block {
                timeout: self.bus.config().block_timeout(),
            });
        let mut sub = self.bus.subscribe_with(format!("worker:{}", entity), options).await?;
        sub.add_filter(
            Some(Kind::SetMonitor),
            Labels::new().with(LABEL_ENTITY, entity.to_string()),
        )?;
        sub.start().await?;

        let record = MonitorRecord::new();
        {
            let mut workers = self.workers();
            if workers.contains_key(&entity) {
                return Err(MonitorError::AlreadyDeclared(entity));
            }
            self.store.put(entity.clone(), record.clone());
            let worker = Worker::new(
                entity.clone(),
                record.clone(),
                self.store.clone(),
                self.bus.clone(),
                sub,
            );
            let (stop, stop_rx) = oneshot::channel();
            let task = tokio::spawn(worker.run(stop_rx));
            workers.insert(entity.clone(), WorkerHandle { stop, task });
        }

        info!(%entity, "Declared entity");
        if let Err(e) = self.bus.publish(Msg::updated(&entity, record.clone())).await {
            warn!(%entity, error = %e, "Failed to publish declared record");
        }
        Ok(record)
    }

    /// Remove an entity's record and stop its worker
    pub async fn forget(&self, entity: &EntityRef) -> Result<(), MonitorError> {
        debug!(%entity, "MonitorManager::forget: called");
        let handle = self
            .workers()
            .remove(entity)
            .ok_or_else(|| MonitorError::NotFound(entity.clone()))?;

        let _ = handle.stop.send(());
        if let Err(e) = handle.task.await {
            warn!(%entity, error = %e, "Worker task failed");
        }
        self.store.remove(entity);

        info!(%entity, "Forgot entity");
        if let Err(e) = self.bus.publish(Msg::deleted(entity)).await {
            warn!(%entity, error = %e, "Failed to publish deletion");
        }
        Ok(())
    }

    /// Forget a node and every instance hosted on it
    pub async fn node_left(&self, node: &str) -> Result<Vec<EntityRef>, MonitorError> {
        debug!(%node, "MonitorManager::node_left: called");
        let mut gone: Vec<EntityRef> = self
            .workers()
            .keys()
            .filter(|e| e.node_name() == node)
            .cloned()
            .collect();
        // Instances first, the node record last
        gone.sort_by_key(|e| (e.is_node(), e.to_string()));

        let mut forgotten = Vec::with_capacity(gone.len());
        for entity in gone {
            match self.forget(&entity).await {
                Ok(()) => forgotten.push(entity),
                // Raced with a concurrent forget
                Err(MonitorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(%node, count = forgotten.len(), "Node left");
        Ok(forgotten)
    }

    /// Stop every worker
    pub async fn shutdown(&self) {
        debug!("MonitorManager::shutdown: called");
        let handles: Vec<_> = self.workers().drain().collect();
        for (entity, handle) in handles {
            let _ = handle.stop.send(());
            if let Err(e) = handle.task.await {
                warn!(%entity, error = %e, "Worker task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, LABEL_NODE};
    use crate::domain::{LocalExpect, MonitorPatch, MonitorState, OrchestrationId};
    use std::time::Duration;

    fn entity(s: &str) -> EntityRef {
        s.parse().unwrap()
    }

    fn manager() -> MonitorManager {
        let bus = Bus::spawn(BusConfig::default());
        MonitorManager::new(bus, MonitorStore::new(), MonitorConfig::default())
    }

    #[tokio::test]
    async fn test_declare_twice_fails() {
        let manager = manager();
        manager.declare(entity("node1")).await.unwrap();
        assert_eq!(
            manager.declare(entity("node1")).await.unwrap_err(),
            MonitorError::AlreadyDeclared(entity("node1"))
        );
        assert!(manager.store().contains(&entity("node1")));
    }

    #[tokio::test]
    async fn test_forget_removes_record_and_publishes() {
        let manager = manager();
        let mut sub = manager.bus().subscribe("observer").await.unwrap();
        sub.add_filter(Some(Kind::NodeMonitorDeleted), Labels::new()).unwrap();
        sub.start().await.unwrap();

        manager.declare(entity("node1")).await.unwrap();
        manager.forget(&entity("node1")).await.unwrap();
        assert!(!manager.store().contains(&entity("node1")));
        assert!(!manager.is_declared(&entity("node1")));

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.labels.get(LABEL_NODE), Some("node1"));

        assert_eq!(
            manager.forget(&entity("node1")).await.unwrap_err(),
            MonitorError::NotFound(entity("node1"))
        );
    }

    #[tokio::test]
    async fn test_node_left_removes_hosted_instances() {
        let manager = manager();
        for e in ["node1", "node2", "ns1/svc/a@node1", "ns1/svc/b@node1", "ns1/svc/a@node2"] {
            manager.declare(entity(e)).await.unwrap();
        }

        let gone = manager.node_left("node1").await.unwrap();
        assert_eq!(gone.len(), 3);
        assert_eq!(gone.last(), Some(&entity("node1")));
        assert_eq!(manager.store().len(), 2);
        assert!(manager.store().contains(&entity("ns1/svc/a@node2")));
    }

    #[tokio::test]
    async fn test_node_worker_ignores_instance_requests() {
        let manager = manager();
        manager.declare(entity("node1")).await.unwrap();
        manager.declare(entity("ns1/svc/a@node1")).await.unwrap();

        let client = manager.client();
        let id = OrchestrationId::new();
        client
            .request_update(
                &entity("ns1/svc/a@node1"),
                MonitorPatch::new().local_expect(LocalExpect::Stop),
                id,
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let node = manager.store().get(&entity("node1")).unwrap();
        assert_eq!(node.state, MonitorState::Idle);
        assert_eq!(node.local_expect, None);
        let instance = manager.store().get(&entity("ns1/svc/a@node1")).unwrap();
        assert_eq!(instance.local_expect, Some(LocalExpect::Stop));
    }
}
