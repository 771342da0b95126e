//! Simulated local driver
//!
//! Watches accepted updates for entities on its node. When a record at rest
//! carries a pending local expectation, the actuator walks it to the
//! transitional state and, after a delay, to the terminal state (or the
//! failure state for configured paths). Every step is a conditional patch
//! under the owning orchestration id, so work that was reverted in the
//! meantime is refused instead of applied.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Kind, LABEL_NODE, Labels, QueueFullPolicy, SubscriptionOptions};
use crate::domain::{EntityRef, LocalExpect, MonitorPatch, MonitorRecord, MonitorState, OrchestrationId};

use super::client::MonitorClient;
use super::config::ActuatorConfig;
use super::messages::MonitorError;

/// Running actuator task
pub struct Actuator {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Actuator {
    /// Subscribe to `node`'s monitor updates and start acting on them
    pub async fn spawn(node: &str, client: MonitorClient, config: ActuatorConfig) -> Result<Self, MonitorError> {
        debug!(%node, ?config, "Actuator::spawn: called");
        let bus = client.bus().clone();
        let options = SubscriptionOptions::from_config(bus.config()).policy(QueueFullPolicy::Block {
            timeout: bus.config().block_timeout(),
        });
        let mut sub = bus.subscribe_with(format!("actuator:{}", node), options).await?;
        let labels = Labels::new().with(LABEL_NODE, node);
        sub.add_filter(Some(Kind::InstanceMonitorUpdated), labels.clone())?;
        sub.add_filter(Some(Kind::NodeMonitorUpdated), labels)?;
        sub.start().await?;

        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let runner = Runner {
            client,
            config: Arc::new(config),
            busy: Arc::new(Mutex::new(HashSet::new())),
        };
        let node = node.to_string();
        let task = tokio::spawn(async move {
            info!(%node, "Actuator started");
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    delivery = sub.recv() => match delivery {
                        Some(delivery) => {
                            if let (Some(entity), Some(record)) = (delivery.msg.entity(), delivery.msg.record()) {
                                runner.observe(entity, record);
                            }
                        }
                        None => break,
                    },
                }
            }
            info!(%node, "Actuator stopped");
        });

        Ok(Self { stop: Some(stop), task })
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Actuator task failed");
        }
    }
}

struct Runner {
    client: MonitorClient,
    config: Arc<ActuatorConfig>,
    busy: Arc<Mutex<HashSet<EntityRef>>>,
}

impl Runner {
    fn observe(&self, entity: EntityRef, record: &MonitorRecord) {
        let (Some(expect), Some(id)) = (record.local_expect, record.orchestration_id) else {
            return;
        };
        if record.state.is_transitional() {
            return;
        }
        if !self.busy.lock().unwrap_or_else(|e| e.into_inner()).insert(entity.clone()) {
            debug!(%entity, "Runner::observe: already acting");
            return;
        }

        let fail = self.should_fail(&entity);
        let from = record.state;
        let client = self.client.clone();
        let busy = self.busy.clone();
        let delay = self.config.step_delay();
        tokio::spawn(async move {
            transition(&client, &entity, expect, from, id, delay, fail).await;
            busy.lock().unwrap_or_else(|e| e.into_inner()).remove(&entity);
        });
    }

    fn should_fail(&self, entity: &EntityRef) -> bool {
        let key = match entity.path() {
            Some(path) => path.to_string(),
            None => entity.node_name().to_string(),
        };
        self.config.fail_paths.iter().any(|p| *p == key)
    }
}

async fn transition(
    client: &MonitorClient,
    entity: &EntityRef,
    expect: LocalExpect,
    from: MonitorState,
    id: OrchestrationId,
    delay: Duration,
    fail: bool,
) {
    debug!(%entity, %expect, %from, %id, fail, "transition: called");
    let timeout = client.default_timeout();
    let begin = MonitorPatch::new()
        .state(expect.transitional())
        .if_state(from)
        .if_local_expect(expect);
    if let Err(e) = client.request_update(entity, begin, id, timeout).await {
        debug!(%entity, error = %e, "transition: not started");
        return;
    }

    tokio::time::sleep(delay).await;

    let end = if fail { expect.failure() } else { expect.target() };
    let finish = MonitorPatch::new()
        .state(end)
        .clear_local_expect()
        .if_state(expect.transitional());
    match client.request_update(entity, finish, id, timeout).await {
        Ok(_) => info!(%entity, %expect, state = %end, "Action finished"),
        Err(e) => debug!(%entity, error = %e, "transition: not finished"),
    }
}
