//! Request/response over the bus
//!
//! A request is validated locally, published labeled with its entity and
//! then answered by that entity's worker through a one-shot reply slot. The
//! caller races the reply against its timeout and an optional cancellation
//! future, in that priority order.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{Bus, BusError, Msg, SetMonitor};
use crate::domain::{EntityRef, MonitorPatch, MonitorRecord, OrchestrationId};

use super::messages::{ReplySlot, UpdateError, UpdateResult};
use super::store::MonitorStore;

#[derive(Debug, Clone)]
pub struct MonitorClient {
    bus: Bus,
    store: MonitorStore,
    default_timeout: Duration,
}

impl MonitorClient {
    pub fn new(bus: Bus, store: MonitorStore, default_timeout: Duration) -> Self {
        Self {
            bus,
            store,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &MonitorStore {
        &self.store
    }

    /// Copy of the entity's current record
    pub fn get(&self, entity: &EntityRef) -> Option<MonitorRecord> {
        self.store.get(entity)
    }

    /// Propose `patch` for `entity` on behalf of `candidate`
    pub async fn request_update(
        &self,
        entity: &EntityRef,
        patch: MonitorPatch,
        candidate: OrchestrationId,
        timeout: Duration,
    ) -> UpdateResult {
        self.request_update_cancellable(entity, patch, candidate, timeout, std::future::pending::<()>())
            .await
    }

    /// Like [`request_update`](Self::request_update), abandoned with
    /// `Canceled` when `cancel` completes first
    pub async fn request_update_cancellable<F>(
        &self,
        entity: &EntityRef,
        patch: MonitorPatch,
        candidate: OrchestrationId,
        timeout: Duration,
        cancel: F,
    ) -> UpdateResult
    where
        F: Future,
    {
        debug!(%entity, %candidate, ?patch, ?timeout, "MonitorClient::request_update: called");
        patch.validate(entity)?;
        if !self.store.contains(entity) {
            return Err(UpdateError::NotFound(entity.clone()));
        }

        let deadline = Instant::now() + timeout;
        let timed_out = || UpdateError::Timeout {
            entity: entity.clone(),
            after: timeout,
        };

        let (reply, reply_rx) = ReplySlot::new();
        let msg = Msg::SetMonitor(SetMonitor {
            entity: entity.clone(),
            patch,
            candidate,
            reply,
        });
        // A full ingress queue is as ambiguous as a late reply
        match tokio::time::timeout_at(deadline, self.bus.publish(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(BusError::PublishTimeout(_))) | Err(_) => return Err(timed_out()),
            Ok(Err(e)) => return Err(e.into()),
        }

        tokio::pin!(cancel);
        let result = tokio::select! {
            biased;
            reply = reply_rx => match reply {
                Ok(result) => result,
                Err(_) => Err(UpdateError::Unavailable(format!("no worker answered for {}", entity))),
            },
            _ = tokio::time::sleep_until(deadline) => Err(timed_out()),
            _ = &mut cancel => Err(UpdateError::Canceled(entity.clone())),
        };

        if let Err(e) = &result {
            warn!(%entity, %candidate, status = e.status(), error = %e, "Monitor update failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::domain::{ConflictReason, LocalExpect, MonitorState, ValidationError};
    use crate::monitor::{MonitorConfig, MonitorManager};

    fn entity(s: &str) -> EntityRef {
        s.parse().unwrap()
    }

    async fn setup(entities: &[&str]) -> MonitorManager {
        let bus = Bus::spawn(BusConfig::default());
        let manager = MonitorManager::new(bus, MonitorStore::new(), MonitorConfig::default());
        for e in entities {
            manager.declare(entity(e)).await.unwrap();
        }
        manager
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_success_updates_record_before_reply() {
        let manager = setup(&["ns1/svc/app1@node1"]).await;
        let client = manager.client();
        let id = OrchestrationId::new();

        let result = client
            .request_update(
                &entity("ns1/svc/app1@node1"),
                MonitorPatch::new().local_expect(LocalExpect::Shutdown),
                id,
                TIMEOUT,
            )
            .await;
        assert_eq!(result, Ok(id));

        let record = client.get(&entity("ns1/svc/app1@node1")).unwrap();
        assert_eq!(record.local_expect, Some(LocalExpect::Shutdown));
        assert_eq!(record.orchestration_id, Some(id));
    }

    #[tokio::test]
    async fn test_conflict_with_other_orchestration() {
        let manager = setup(&["ns1/svc/app1@node1"]).await;
        let client = manager.client();
        let first = OrchestrationId::new();
        let target = entity("ns1/svc/app1@node1");

        client
            .request_update(&target, MonitorPatch::new().state(MonitorState::Starting), first, TIMEOUT)
            .await
            .unwrap();

        let err = client
            .request_update(
                &target,
                MonitorPatch::new().local_expect(LocalExpect::Stop),
                OrchestrationId::new(),
                TIMEOUT,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 409);
        assert!(matches!(err, UpdateError::Conflict(ConflictReason::InFlight { current, .. }) if current == first));
        assert_eq!(client.get(&target).unwrap().orchestration_id, Some(first));
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let manager = setup(&["node1"]).await;
        let client = manager.client();

        let err = client
            .request_update(&entity("node1"), MonitorPatch::new(), OrchestrationId::new(), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, UpdateError::Validation(ValidationError::EmptyPatch));

        let err = client
            .request_update(
                &entity("node9"),
                MonitorPatch::new().local_expect(LocalExpect::Freeze),
                OrchestrationId::new(),
                TIMEOUT,
            )
            .await
            .unwrap_err();
        assert_eq!(err, UpdateError::NotFound(entity("node9")));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let manager = setup(&["node1"]).await;
        let client = manager.client();

        let err = client
            .request_update_cancellable(
                &entity("node1"),
                MonitorPatch::new().local_expect(LocalExpect::Freeze),
                OrchestrationId::new(),
                TIMEOUT,
                std::future::ready(()),
            )
            .await;
        // The reply may already be there; either way exactly one outcome is returned
        match err {
            Ok(_) => {}
            Err(e) => assert_eq!(e, UpdateError::Canceled(entity("node1"))),
        }
    }

    #[tokio::test]
    async fn test_unowned_entity_is_unavailable() {
        let bus = Bus::spawn(BusConfig::default());
        let store = MonitorStore::new();
        // A record without a worker
        store.put(entity("node1"), MonitorRecord::new());
        let client = MonitorClient::new(bus, store, TIMEOUT);

        let started = Instant::now();
        let err = client
            .request_update(
                &entity("node1"),
                MonitorPatch::new().local_expect(LocalExpect::Freeze),
                OrchestrationId::new(),
                TIMEOUT,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 503);
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test]
    async fn test_timeout_when_worker_is_stuck() {
        let bus = Bus::spawn(BusConfig::default());
        let store = MonitorStore::new();
        store.put(entity("node1"), MonitorRecord::new());

        // Holds every request without answering
        let mut holder = bus.subscribe("holder").await.unwrap();
        holder.start().await.unwrap();

        let client = MonitorClient::new(bus, store, TIMEOUT);
        let timeout = Duration::from_millis(50);
        let started = Instant::now();
        let err = client
            .request_update(
                &entity("node1"),
                MonitorPatch::new().local_expect(LocalExpect::Freeze),
                OrchestrationId::new(),
                timeout,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 408);
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(holder);
    }

    #[tokio::test]
    async fn test_publish_timeout_is_timeout() {
        let config = BusConfig {
            ingress_capacity: 1,
            publish_timeout_ms: 20,
            block_timeout_ms: 5000,
            ..Default::default()
        };
        let bus = Bus::spawn(config);
        let store = MonitorStore::new();
        store.put(entity("node1"), MonitorRecord::new());

        // Never read: the dispatcher stalls on its second delivery
        let options = crate::bus::SubscriptionOptions::from_config(bus.config()).capacity(1);
        let mut holder = bus.subscribe_with("holder", options).await.unwrap();
        holder.start().await.unwrap();

        let mut ingress_full = false;
        for _ in 0..10 {
            if let Err(e) = bus.publish(Msg::updated(&entity("node2"), MonitorRecord::new())).await {
                assert!(matches!(e, BusError::PublishTimeout(_)));
                ingress_full = true;
                break;
            }
        }
        assert!(ingress_full);

        let client = MonitorClient::new(bus, store, TIMEOUT);
        let err = client
            .request_update(
                &entity("node1"),
                MonitorPatch::new().local_expect(LocalExpect::Freeze),
                OrchestrationId::new(),
                TIMEOUT,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Timeout { .. }));
        assert_eq!(err.status(), 408);
        drop(holder);
    }
}
