//! Per-entity worker task
//!
//! Exactly one worker owns each entity's record. It is the only writer of
//! that record, so update requests for one entity are applied in the order
//! the bus delivers them.

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Delivery, Msg, SetMonitor, SetMonitorRefused, Subscription};
use crate::domain::{EntityRef, MonitorRecord};

use super::messages::UpdateError;
use super::store::MonitorStore;

pub(crate) struct Worker {
    entity: EntityRef,
    record: MonitorRecord,
    store: MonitorStore,
    bus: Bus,
    sub: Subscription,
}

impl Worker {
    /// `sub` must already be started with this entity's request filter
    pub(crate) fn new(entity: EntityRef, record: MonitorRecord, store: MonitorStore, bus: Bus, sub: Subscription) -> Self {
        Self {
            entity,
            record,
            store,
            bus,
            sub,
        }
    }

    pub(crate) async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        debug!(entity = %self.entity, "Worker::run: started");

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    debug!(entity = %self.entity, "Worker::run: stop requested");
                    break;
                }
                delivery = self.sub.recv() => match delivery {
                    Some(delivery) => self.handle(&delivery).await,
                    None => {
                        info!(entity = %self.entity, "Worker subscription ended");
                        break;
                    }
                },
            }
        }

        self.sub.stop();
        debug!(entity = %self.entity, "Worker::run: exited");
    }

    async fn handle(&mut self, delivery: &Delivery) {
        let Msg::SetMonitor(req) = delivery.msg.as_ref() else {
            return;
        };
        if req.entity != self.entity {
            return;
        }
        debug!(entity = %self.entity, seq = delivery.seq, candidate = %req.candidate, "Worker::handle: called");

        match self.record.check(&req.patch, req.candidate) {
            Ok(()) => self.accept(req).await,
            Err(reason) => {
                warn!(entity = %self.entity, candidate = %req.candidate, %reason, "Refused monitor update");
                let refused = Msg::SetMonitorRefused(SetMonitorRefused {
                    entity: self.entity.clone(),
                    candidate: req.candidate,
                    reason: reason.clone(),
                });
                if let Err(e) = self.bus.publish(refused).await {
                    warn!(entity = %self.entity, error = %e, "Failed to publish refusal");
                }
                req.reply.send(Err(UpdateError::Conflict(reason)));
            }
        }
    }

    async fn accept(&mut self, req: &SetMonitor) {
        self.record.apply(&req.patch, req.candidate);
        self.store.put(self.entity.clone(), self.record.clone());
        debug!(
            entity = %self.entity,
            state = %self.record.state,
            local_expect = ?self.record.local_expect,
            orchestration = ?self.record.orchestration_id,
            "Applied monitor update"
        );

        if let Err(e) = self.bus.publish(Msg::updated(&self.entity, self.record.clone())).await {
            warn!(entity = %self.entity, error = %e, "Failed to publish monitor update");
        }
        if !req.reply.send(Ok(req.candidate)) {
            debug!(entity = %self.entity, "Update applied but caller no longer waiting");
        }
    }
}
