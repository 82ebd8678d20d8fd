//! Subscription handles and the deliveries they produce.

use std::fmt;

use ekklesia_shared::{InboundEvent, Topic};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One open topic registration.
///
/// Not `Clone`: the owner gives it back through `EventBus::unsubscribe`, so
/// a registration is released exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn new(id: SubscriptionId, topic: Topic) -> Self {
        Self { id, topic }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

/// An event delivered to one subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub topic: Topic,
    pub event: InboundEvent,
}

/// Where a subscription pushes its deliveries.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;
