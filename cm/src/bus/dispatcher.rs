//! Bus handle and dispatcher task
//!
//! The dispatcher owns the subscription registry, the sequence counter and
//! the metrics. Everything else talks to it through [`BusCommand`]s sent by
//! the cloneable [`Bus`] handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::config::BusConfig;
use super::error::BusError;
use super::msg::Msg;
use super::subscription::Subscription;
use super::types::{Delivery, Filter, Labels, SubscriptionId};

/// What the dispatcher does when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Wait up to `timeout` for room, then drop and mark the subscriber lagging
    Block { timeout: Duration },
    /// Drop the delivery for this subscriber only
    Drop,
}

/// Allocation options for one subscription
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub capacity: usize,
    pub policy: QueueFullPolicy,
    pub alloc_timeout: Duration,
}

impl SubscriptionOptions {
    /// Blocking subscriber with the configured defaults
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            capacity: config.subscriber_capacity,
            policy: QueueFullPolicy::Block {
                timeout: config.block_timeout(),
            },
            alloc_timeout: config.alloc_timeout(),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn policy(mut self, policy: QueueFullPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn alloc_timeout(mut self, alloc_timeout: Duration) -> Self {
        self.alloc_timeout = alloc_timeout;
        self
    }
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

pub(crate) type Registration = (SubscriptionId, mpsc::Receiver<Delivery>);

/// Requests handled by the dispatcher task
pub(crate) enum BusCommand {
    Publish {
        msg: Msg,
        labels: Labels,
    },
    Register {
        name: String,
        capacity: usize,
        policy: QueueFullPolicy,
        reply: oneshot::Sender<Result<Registration, BusError>>,
    },
    Activate {
        id: SubscriptionId,
        filters: Vec<Filter>,
        reply: oneshot::Sender<Result<(), BusError>>,
    },
    Unregister {
        id: SubscriptionId,
    },
    GetMetrics {
        reply: oneshot::Sender<BusMetrics>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running bus
#[derive(Clone)]
pub struct Bus {
    tx: mpsc::Sender<BusCommand>,
    config: Arc<BusConfig>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Start a dispatcher task and return a handle to it
    pub fn spawn(config: BusConfig) -> Self {
        debug!(?config, "Bus::spawn: called");
        let (tx, rx) = mpsc::channel(config.ingress_capacity.max(1));
        let config = Arc::new(config);
        let dispatcher = Dispatcher::new(rx, config.max_subscribers);
        tokio::spawn(dispatcher.run());
        Self { tx, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Publish with the labels derived from the message itself
    pub async fn publish(&self, msg: Msg) -> Result<(), BusError> {
        let labels = msg.labels();
        self.publish_with(msg, labels).await
    }

    /// Publish with explicit labels
    ///
    /// Waits at most `publish-timeout-ms` for room on the ingress queue and
    /// never waits on subscribers.
    pub async fn publish_with(&self, msg: Msg, labels: Labels) -> Result<(), BusError> {
        debug!(kind = %msg.kind(), %labels, "Bus::publish_with: called");
        let after = self.config.publish_timeout();
        self.tx
            .send_timeout(BusCommand::Publish { msg, labels }, after)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => BusError::PublishTimeout(after),
                SendTimeoutError::Closed(_) => BusError::Closed,
            })
    }

    /// Allocate a blocking subscription with the default timeout
    pub async fn subscribe(&self, name: impl Into<String>) -> Result<Subscription, BusError> {
        self.subscribe_with(name, SubscriptionOptions::from_config(&self.config))
            .await
    }

    /// Allocate a blocking subscription, failing if the dispatcher does not answer within `after`
    pub async fn sub_with_timeout(&self, name: impl Into<String>, after: Duration) -> Result<Subscription, BusError> {
        let options = SubscriptionOptions::from_config(&self.config).alloc_timeout(after);
        self.subscribe_with(name, options).await
    }

    pub async fn subscribe_with(
        &self,
        name: impl Into<String>,
        options: SubscriptionOptions,
    ) -> Result<Subscription, BusError> {
        let name = name.into();
        debug!(%name, ?options, "Bus::subscribe_with: called");

        let (reply, reply_rx) = oneshot::channel();
        let cmd = BusCommand::Register {
            name: name.clone(),
            capacity: options.capacity.max(1),
            policy: options.policy,
            reply,
        };
        let alloc = async {
            self.tx.send(cmd).await.map_err(|_| BusError::Closed)?;
            reply_rx.await.map_err(|_| BusError::Closed)?
        };
        let (id, rx) = tokio::time::timeout(options.alloc_timeout, alloc)
            .await
            .map_err(|_| BusError::AllocTimeout {
                name: name.clone(),
                after: options.alloc_timeout,
            })??;

        debug!(%name, %id, "Bus::subscribe_with: allocated");
        Ok(Subscription::new(id, name, self.tx.clone(), rx, options.alloc_timeout))
    }

    pub async fn metrics(&self) -> Result<BusMetrics, BusError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BusCommand::GetMetrics { reply })
            .await
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Stop the dispatcher; later publishes fail with `Closed`
    pub async fn shutdown(&self) {
        debug!("Bus::shutdown: called");
        let (reply, rx) = oneshot::channel();
        if self.tx.send(BusCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

enum Outcome {
    Delivered,
    Dropped,
    Gone,
}

struct Entry {
    name: String,
    tx: mpsc::Sender<Delivery>,
    policy: QueueFullPolicy,
    filters: Vec<Filter>,
    active: bool,
    lagging: bool,
    dropped: u64,
}

impl Entry {
    /// An active subscriber without filters receives everything
    fn wants(&self, delivery: &Delivery) -> bool {
        let kind = delivery.msg.kind();
        self.active && (self.filters.is_empty() || self.filters.iter().any(|f| f.matches(kind, &delivery.labels)))
    }

    async fn deliver(&mut self, delivery: Delivery) -> Outcome {
        let timeout = match self.policy {
            QueueFullPolicy::Block { timeout } => timeout,
            QueueFullPolicy::Drop => return self.try_deliver(delivery),
        };

        if self.lagging {
            if self.tx.capacity() == self.tx.max_capacity() {
                info!(subscription = %self.name, dropped = self.dropped, "Subscriber caught up");
                self.lagging = false;
            } else {
                return self.try_deliver(delivery);
            }
        }

        match self.tx.send_timeout(delivery, timeout).await {
            Ok(()) => Outcome::Delivered,
            Err(SendTimeoutError::Timeout(_)) => {
                self.dropped += 1;
                self.lagging = true;
                warn!(subscription = %self.name, ?timeout, "Subscriber queue full, marking lagging");
                Outcome::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => Outcome::Gone,
        }
    }

    fn try_deliver(&mut self, delivery: Delivery) -> Outcome {
        match self.tx.try_send(delivery) {
            Ok(()) => Outcome::Delivered,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    warn!(subscription = %self.name, dropped = self.dropped, "Dropping deliveries for slow subscriber");
                }
                Outcome::Dropped
            }
            Err(TrySendError::Closed(_)) => Outcome::Gone,
        }
    }
}

struct Dispatcher {
    rx: mpsc::Receiver<BusCommand>,
    max_subscribers: usize,
    entries: BTreeMap<SubscriptionId, Entry>,
    next_id: u64,
    seq: u64,
    metrics: BusMetrics,
}

impl Dispatcher {
    fn new(rx: mpsc::Receiver<BusCommand>, max_subscribers: usize) -> Self {
        Self {
            rx,
            max_subscribers,
            entries: BTreeMap::new(),
            next_id: 0,
            seq: 0,
            metrics: BusMetrics::default(),
        }
    }

    async fn run(mut self) {
        info!("Bus dispatcher started");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                BusCommand::Publish { msg, labels } => self.dispatch(msg, labels).await,
                BusCommand::Register {
                    name,
                    capacity,
                    policy,
                    reply,
                } => self.register(name, capacity, policy, reply),
                BusCommand::Activate { id, filters, reply } => {
                    let result = match self.entries.get_mut(&id) {
                        Some(entry) => {
                            debug!(subscription = %entry.name, %id, filters = filters.len(), "Activating subscription");
                            entry.filters = filters;
                            entry.active = true;
                            Ok(())
                        }
                        None => Err(BusError::Stopped(id.to_string())),
                    };
                    let _ = reply.send(result);
                }
                BusCommand::Unregister { id } => {
                    if let Some(entry) = self.entries.remove(&id) {
                        debug!(subscription = %entry.name, %id, "Unregistered subscription");
                    }
                }
                BusCommand::GetMetrics { reply } => {
                    self.metrics.subscribers = self.entries.len();
                    let _ = reply.send(self.metrics.clone());
                }
                BusCommand::Shutdown { reply } => {
                    info!("Bus dispatcher shutting down");
                    self.rx.close();
                    self.entries.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        info!(
            published = self.metrics.published,
            delivered = self.metrics.delivered,
            dropped = self.metrics.dropped,
            "Bus dispatcher stopped"
        );
    }

    fn register(
        &mut self,
        name: String,
        capacity: usize,
        policy: QueueFullPolicy,
        reply: oneshot::Sender<Result<Registration, BusError>>,
    ) {
        if self.entries.len() >= self.max_subscribers {
            warn!(%name, limit = self.max_subscribers, "Subscriber limit reached");
            let _ = reply.send(Err(BusError::TooManySubscribers {
                limit: self.max_subscribers,
            }));
            return;
        }

        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let (tx, rx) = mpsc::channel(capacity);
        self.entries.insert(
            id,
            Entry {
                name: name.clone(),
                tx,
                policy,
                filters: Vec::new(),
                active: false,
                lagging: false,
                dropped: 0,
            },
        );

        // Caller gave up waiting: release the slot again
        if reply.send(Ok((id, rx))).is_err() {
            debug!(%name, %id, "Registration abandoned");
            self.entries.remove(&id);
        }
    }

    async fn dispatch(&mut self, msg: Msg, labels: Labels) {
        self.seq += 1;
        self.metrics.published += 1;
        let delivery = Delivery {
            seq: self.seq,
            time: Utc::now(),
            msg: Arc::new(msg),
            labels: Arc::new(labels),
        };

        let mut gone = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if !entry.wants(&delivery) {
                continue;
            }
            match entry.deliver(delivery.clone()).await {
                Outcome::Delivered => self.metrics.delivered += 1,
                Outcome::Dropped => self.metrics.dropped += 1,
                Outcome::Gone => gone.push(*id),
            }
        }

        for id in gone {
            if let Some(entry) = self.entries.remove(&id) {
                debug!(subscription = %entry.name, %id, "Removed subscriber with closed queue");
            }
        }
    }
}
