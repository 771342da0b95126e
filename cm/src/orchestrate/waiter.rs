//! Convergence waiter
//!
//! Drives one multi-entity orchestration:
//!
//! ```text
//!   classify targets ──▶ subscribe + start ──▶ issue updates (concurrent)
//!                                                   │ any refused?
//!                                        yes ◀──────┤
//!                                         │         ▼ no
//!                                         │   observe updates until the
//!                                         │   wait-set is empty, a failure
//!                                         │   state shows up, or the deadline
//!                                         ▼              │
//!                                    revert pass ◀───────┘ (on failure)
//! ```
//!
//! Every outcome ends with an `OrchestrationEnd` event.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{
    BusError, Kind, Labels, Msg, OrchestrationEnd, QueueFullPolicy, Subscription, SubscriptionOptions,
};
use crate::domain::{EntityRef, LocalExpect, MonitorPatch, MonitorState, OrchestrationId};
use crate::monitor::{MonitorClient, UpdateError};

use super::config::OrchestrationConfig;
use super::waitset::{Observation, WaitSet};

/// One intent applied to a set of entities
#[derive(Debug, Clone)]
pub struct Orchestration {
    pub id: OrchestrationId,
    pub intent: LocalExpect,
    pub targets: Vec<EntityRef>,
    pub deadline: Duration,
    /// Node that runs the orchestration
    pub node: String,
}

impl Orchestration {
    pub fn new(intent: LocalExpect, targets: Vec<EntityRef>, deadline: Duration, node: impl Into<String>) -> Self {
        Self {
            id: OrchestrationId::new(),
            intent,
            targets,
            deadline,
            node: node.into(),
        }
    }
}

/// Summary of a converged orchestration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub id: OrchestrationId,
    pub intent: LocalExpect,
    /// Reached the expected state during this run
    pub converged: Vec<EntityRef>,
    /// Already in the expected state, not waited on
    pub already: Vec<EntityRef>,
    /// Owned by another orchestration, not waited on
    pub busy: Vec<EntityRef>,
    /// Not declared, not waited on
    pub missing: Vec<EntityRef>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestrationError {
    #[error("Update of {entity} rejected: {source}")]
    Rejected {
        entity: EntityRef,
        #[source]
        source: UpdateError,
    },

    #[error("Deadline of {after:?} exceeded with {pending} entities pending")]
    DeadlineExceeded { after: Duration, pending: usize },

    #[error("Entity failed: {0}")]
    EntityFailed(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl OrchestrationError {
    /// HTTP-style status code
    pub fn status(&self) -> u16 {
        match self {
            Self::Rejected { source, .. } => source.status(),
            Self::DeadlineExceeded { .. } => 408,
            Self::EntityFailed(_) => 500,
            Self::Bus(_) => 503,
        }
    }
}

/// Runs orchestrations against the monitor protocol
#[derive(Debug, Clone)]
pub struct ConvergenceWaiter {
    client: MonitorClient,
    config: OrchestrationConfig,
}

impl ConvergenceWaiter {
    pub fn new(client: MonitorClient, config: OrchestrationConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Run `orch` to convergence or failure; failures are reverted before returning
    pub async fn run(&self, orch: Orchestration) -> Result<OrchestrationReport, OrchestrationError> {
        debug!(id = %orch.id, intent = %orch.intent, targets = orch.targets.len(), "ConvergenceWaiter::run: called");
        let started = Instant::now();
        let deadline = started + orch.deadline;

        let mut report = OrchestrationReport {
            id: orch.id,
            intent: orch.intent,
            converged: Vec::new(),
            already: Vec::new(),
            busy: Vec::new(),
            missing: Vec::new(),
            elapsed_ms: 0,
        };
        let mut wait = self.classify(&orch, &mut report);
        info!(
            id = %orch.id,
            intent = %orch.intent,
            waiting = wait.len(),
            already = report.already.len(),
            busy = report.busy.len(),
            missing = report.missing.len(),
            "Orchestration started"
        );

        let result = if wait.is_empty() {
            Ok(())
        } else {
            self.converge(&orch, &mut wait, deadline).await
        };

        report.converged = wait.done().to_vec();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.publish_end(&orch, result.as_ref().err()).await;

        match result {
            Ok(()) => {
                info!(id = %orch.id, converged = report.converged.len(), elapsed_ms = report.elapsed_ms, "Orchestration converged");
                Ok(report)
            }
            Err(e) => {
                warn!(id = %orch.id, error = %e, "Orchestration failed");
                Err(e)
            }
        }
    }

    /// Split targets into the wait-set and the ones reported without waiting
    fn classify(&self, orch: &Orchestration, report: &mut OrchestrationReport) -> WaitSet {
        let target = orch.intent.target();
        let mut wait = WaitSet::new(orch.id);
        for entity in &orch.targets {
            match self.client.get(entity) {
                None => report.missing.push(entity.clone()),
                Some(record) if record.state == target && record.local_expect.is_none() => {
                    report.already.push(entity.clone())
                }
                Some(record) if record.is_in_flight() => report.busy.push(entity.clone()),
                Some(record) => wait.insert(entity.clone(), record.state, target),
            }
        }
        wait
    }

    async fn converge(
        &self,
        orch: &Orchestration,
        wait: &mut WaitSet,
        deadline: Instant,
    ) -> Result<(), OrchestrationError> {
        let mut sub = self.subscribe(orch, wait).await?;

        if let Err(e) = self.issue(orch, wait, deadline).await {
            self.revert(orch, wait).await;
            return Err(e);
        }

        let result = self.observe(orch, wait, &mut sub, deadline).await;
        sub.stop();
        if result.is_err() {
            self.revert(orch, wait).await;
        }
        result
    }

    /// Subscribe to the wait-set's updates before any request is issued
    async fn subscribe(&self, orch: &Orchestration, wait: &WaitSet) -> Result<Subscription, OrchestrationError> {
        let bus = self.client.bus();
        let options = SubscriptionOptions::from_config(bus.config())
            .capacity(bus.config().subscriber_capacity.max(wait.len() * 4))
            .policy(QueueFullPolicy::Block {
                timeout: bus.config().block_timeout(),
            });
        let mut sub = bus
            .subscribe_with(format!("waiter:{}", orch.id.short()), options)
            .await?;
        for entity in wait.pending() {
            let labels = Labels::for_entity(entity);
            let (updated, deleted) = if entity.is_node() {
                (Kind::NodeMonitorUpdated, Kind::NodeMonitorDeleted)
            } else {
                (Kind::InstanceMonitorUpdated, Kind::InstanceMonitorDeleted)
            };
            sub.add_filter(Some(updated), labels.clone())?;
            sub.add_filter(Some(deleted), labels)?;
        }
        sub.start().await?;
        Ok(sub)
    }

    /// Set the local expectation on every waited entity, collecting all outcomes
    async fn issue(&self, orch: &Orchestration, wait: &WaitSet, deadline: Instant) -> Result<(), OrchestrationError> {
        let timeout = self
            .client
            .default_timeout()
            .min(deadline.saturating_duration_since(Instant::now()));
        let patch = MonitorPatch::new().local_expect(orch.intent);

        let mut requests: FuturesUnordered<_> = wait
            .pending()
            .cloned()
            .map(|entity| {
                let patch = patch.clone();
                async move {
                    let result = self.client.request_update(&entity, patch, orch.id, timeout).await;
                    (entity, result)
                }
            })
            .collect();

        let mut first_failure = None;
        while let Some((entity, result)) = requests.next().await {
            match result {
                Ok(_) => debug!(id = %orch.id, %entity, "ConvergenceWaiter::issue: accepted"),
                Err(source) => {
                    warn!(id = %orch.id, %entity, error = %source, "Orchestration update refused");
                    if first_failure.is_none() {
                        first_failure = Some(OrchestrationError::Rejected { entity, source });
                    }
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn observe(
        &self,
        orch: &Orchestration,
        wait: &mut WaitSet,
        sub: &mut Subscription,
        deadline: Instant,
    ) -> Result<(), OrchestrationError> {
        loop {
            let delivery = tokio::select! {
                biased;
                delivery = sub.recv() => delivery,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(OrchestrationError::DeadlineExceeded {
                        after: orch.deadline,
                        pending: wait.len(),
                    });
                }
            };
            let Some(delivery) = delivery else {
                return Err(OrchestrationError::Bus(BusError::Closed));
            };

            let Some(entity) = delivery.msg.entity() else {
                continue;
            };
            let observation = match delivery.msg.record() {
                Some(record) => wait.observe(&entity, record),
                None => wait.observe_deleted(&entity),
            };
            match observation {
                Observation::Converged => return Ok(()),
                Observation::Failed(reason) => return Err(OrchestrationError::EntityFailed(reason)),
                Observation::Progress => {
                    debug!(id = %orch.id, %entity, remaining = wait.len(), "ConvergenceWaiter::observe: progress")
                }
                Observation::Ignored => {}
            }
        }
    }

    /// Best-effort: undo pending work this orchestration still owns
    async fn revert(&self, orch: &Orchestration, wait: &WaitSet) {
        debug!(id = %orch.id, pending = wait.len(), "ConvergenceWaiter::revert: called");
        let mut reverts: FuturesUnordered<_> = wait.pending().map(|entity| self.revert_one(orch, entity)).collect();
        while reverts.next().await.is_some() {}
    }

    /// Return one entity to Idle, or drop its pending expectation if it rests
    /// in a terminal state
    ///
    /// The actuator may move the entity between the snapshot and the request;
    /// a refusal caused by that is retried once against a fresh snapshot.
    async fn revert_one(&self, orch: &Orchestration, entity: &EntityRef) {
        let timeout = self.config.revert_timeout();
        for attempt in 0..2 {
            let Some(record) = self.client.get(entity) else {
                return;
            };
            if record.orchestration_id != Some(orch.id) {
                return;
            }
            let patch = if !record.state.is_terminal() {
                MonitorPatch::new().state(MonitorState::Idle).clear_local_expect()
            } else if record.local_expect.is_some() {
                MonitorPatch::new().clear_local_expect().if_state(record.state)
            } else {
                return;
            };

            match self.client.request_update(entity, patch, orch.id, timeout).await {
                Ok(_) => {
                    info!(id = %orch.id, %entity, "Reverted");
                    return;
                }
                Err(UpdateError::Conflict(reason)) if attempt == 0 => {
                    debug!(id = %orch.id, %entity, %reason, "ConvergenceWaiter::revert_one: retrying");
                }
                Err(e) => {
                    warn!(id = %orch.id, %entity, error = %e, "Revert failed");
                    return;
                }
            }
        }
    }

    async fn publish_end(&self, orch: &Orchestration, error: Option<&OrchestrationError>) {
        let end = Msg::OrchestrationEnd(OrchestrationEnd {
            id: orch.id,
            node: orch.node.clone(),
            intent: orch.intent,
            success: error.is_none(),
            reason: error.map(|e| e.to_string()),
        });
        if let Err(e) = self.client.bus().publish(end).await {
            warn!(id = %orch.id, error = %e, "Failed to publish orchestration end");
        }
    }
}
