//! Event bus - in-process publish/subscribe router
//!
//! ```text
//!  publish(msg, labels)          +-------------+      +----------------+
//!  ─────────────────────────────▶│   ingress   │─────▶│   dispatcher   │
//!                                │ (bounded)   │      │ registry, seq, │
//!                                +-------------+      │ metrics        │
//!                                                     +-------+--------+
//!                              kind + label filters           │
//!                      ┌──────────────────┬───────────────────┤
//!                      ▼                  ▼                   ▼
//!               [queue] worker     [queue] waiter      [queue] stream
//!               Block policy       Block policy        Drop policy
//! ```
//!
//! Publishers never wait on subscribers, only on the ingress queue. Each
//! subscription has its own bounded queue and [`QueueFullPolicy`].

mod config;
mod dispatcher;
mod error;
mod msg;
mod subscription;
mod types;

pub use config::BusConfig;
pub use dispatcher::{Bus, BusMetrics, QueueFullPolicy, SubscriptionOptions};
pub use error::BusError;
pub use msg::{
    InstanceMonitorDeleted, InstanceMonitorUpdated, Msg, NodeMonitorDeleted, NodeMonitorUpdated, OrchestrationEnd,
    SetMonitor, SetMonitorRefused, WireError,
};
pub use subscription::{Subscription, SubscriptionState};
pub use types::{Delivery, Filter, Kind, LABEL_ENTITY, LABEL_NODE, LABEL_PATH, Labels, SubscriptionId};
