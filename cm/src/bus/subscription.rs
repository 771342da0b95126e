//! Subscription handle
//!
//! Lifecycle is `Created -> Started -> Stopped`. Filters may only be added
//! while `Created`; nothing is delivered until `start()` and nothing
//! published before it is backfilled.

use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::dispatcher::BusCommand;
use super::error::BusError;
use super::types::{Delivery, Filter, Kind, Labels, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Started,
    Stopped,
}

pub struct Subscription {
    id: SubscriptionId,
    name: String,
    bus_tx: mpsc::Sender<BusCommand>,
    rx: mpsc::Receiver<Delivery>,
    filters: Vec<Filter>,
    state: SubscriptionState,
    ack_timeout: Duration,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("filters", &self.filters)
            .field("state", &self.state)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        name: String,
        bus_tx: mpsc::Sender<BusCommand>,
        rx: mpsc::Receiver<Delivery>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            id,
            name,
            bus_tx,
            rx,
            filters: Vec::new(),
            state: SubscriptionState::Created,
            ack_timeout,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Add a filter entry; `kind == None` matches any kind
    pub fn add_filter(&mut self, kind: Option<Kind>, labels: Labels) -> Result<(), BusError> {
        debug!(subscription = %self.name, ?kind, %labels, "Subscription::add_filter: called");
        match self.state {
            SubscriptionState::Created => {
                self.filters.push(Filter::new(kind, labels));
                Ok(())
            }
            SubscriptionState::Started => Err(BusError::AlreadyStarted(self.name.clone())),
            SubscriptionState::Stopped => Err(BusError::Stopped(self.name.clone())),
        }
    }

    /// Activate delivery with the filters added so far
    pub async fn start(&mut self) -> Result<(), BusError> {
        debug!(subscription = %self.name, filters = self.filters.len(), "Subscription::start: called");
        match self.state {
            SubscriptionState::Created => {}
            SubscriptionState::Started => return Err(BusError::AlreadyStarted(self.name.clone())),
            SubscriptionState::Stopped => return Err(BusError::Stopped(self.name.clone())),
        }

        let (reply, reply_rx) = oneshot::channel();
        let cmd = BusCommand::Activate {
            id: self.id,
            filters: self.filters.clone(),
            reply,
        };
        let activate = async {
            self.bus_tx.send(cmd).await.map_err(|_| BusError::Closed)?;
            reply_rx.await.map_err(|_| BusError::Closed)?
        };
        tokio::time::timeout(self.ack_timeout, activate)
            .await
            .map_err(|_| BusError::AllocTimeout {
                name: self.name.clone(),
                after: self.ack_timeout,
            })??;

        self.state = SubscriptionState::Started;
        Ok(())
    }

    /// Next delivery, or `None` when not started, stopped, or the bus is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        if self.state != SubscriptionState::Started {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        if self.state != SubscriptionState::Started {
            return None;
        }
        match self.rx.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Release the registry slot; safe to call more than once
    pub fn stop(&mut self) {
        if self.state == SubscriptionState::Stopped {
            return;
        }
        debug!(subscription = %self.name, id = %self.id, "Subscription::stop: called");
        self.state = SubscriptionState::Stopped;
        self.rx.close();

        let unregister = BusCommand::Unregister { id: self.id };
        match self.bus_tx.try_send(unregister) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                // Ingress is busy; hand the unregister to a task if we can
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.bus_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(cmd).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusConfig};

    #[tokio::test]
    async fn test_add_filter_after_start_fails() {
        let bus = Bus::spawn(BusConfig::default());
        let mut sub = bus.subscribe("test").await.unwrap();
        sub.add_filter(Some(Kind::OrchestrationEnd), Labels::new()).unwrap();
        sub.start().await.unwrap();
        assert_eq!(sub.state(), SubscriptionState::Started);

        assert_eq!(
            sub.add_filter(None, Labels::new()),
            Err(BusError::AlreadyStarted("test".to_string()))
        );
        assert_eq!(sub.start().await, Err(BusError::AlreadyStarted("test".to_string())));
        assert_eq!(sub.filters().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_subscription() {
        let bus = Bus::spawn(BusConfig::default());
        let mut sub = bus.subscribe("test").await.unwrap();
        sub.stop();
        assert_eq!(sub.state(), SubscriptionState::Stopped);
        assert!(sub.add_filter(None, Labels::new()).is_err());
        assert!(sub.start().await.is_err());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_before_start_returns_none() {
        let bus = Bus::spawn(BusConfig::default());
        let mut sub = bus.subscribe("test").await.unwrap();
        assert!(sub.recv().await.is_none());
        assert!(sub.try_recv().is_none());
    }
}
