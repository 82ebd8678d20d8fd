//! The event bus contract and an in-process implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ekklesia_shared::{InboundEvent, Topic};
use tracing::{debug, info, warn};

use crate::error::{BusError, Result};
use crate::handle::{Delivery, DeliverySink, SubscriptionHandle, SubscriptionId};

/// Push-subscription primitive used by the sync engine.
pub trait EventBus: Send + Sync {
    /// Open a registration on `topic`. Deliveries go to `sink` until the
    /// returned handle is released.
    fn subscribe(&self, topic: Topic, sink: DeliverySink) -> Result<SubscriptionHandle>;

    /// Release a registration.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

struct Registration {
    topic: Topic,
    sink: DeliverySink,
}

struct BusState {
    next_id: u64,
    online: bool,
    registrations: BTreeMap<SubscriptionId, Registration>,
}

/// In-process bus. Cloning shares the same registrations.
#[derive(Clone)]
pub struct LocalEventBus {
    state: Arc<Mutex<BusState>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 1,
                online: true,
                registrations: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BusState>> {
        self.state.lock().map_err(|_| BusError::Poisoned)
    }

    /// Deliver `event` to every registration on `topic`, in registration
    /// order. Returns the number of deliveries made.
    pub fn publish(&self, topic: &Topic, event: InboundEvent) -> Result<usize> {
        event.validate_for(topic)?;

        let mut state = self.lock()?;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, registration) in state.registrations.iter() {
            if &registration.topic != topic {
                continue;
            }
            let delivery = Delivery {
                subscription: *id,
                topic: topic.clone(),
                event: event.clone(),
            };
            if registration.sink.send(delivery).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }

        for id in closed {
            warn!(subscription = %id, topic = %topic, "Pruning subscription with closed sink");
            state.registrations.remove(&id);
        }

        if delivered == 0 {
            debug!(topic = %topic, "No subscribers, event dropped");
        }
        Ok(delivered)
    }

    /// Validate a raw JSON payload at the boundary, then publish it.
    pub fn publish_json(&self, topic: &Topic, raw: &str) -> Result<usize> {
        let event = InboundEvent::from_json(raw)?;
        self.publish(topic, event)
    }

    /// Toggle connectivity. While offline every `subscribe` call fails;
    /// existing registrations keep receiving.
    pub fn set_online(&self, online: bool) -> Result<()> {
        self.lock()?.online = online;
        info!(online, "Event bus connectivity changed");
        Ok(())
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().map(|s| s.registrations.len()).unwrap_or(0)
    }

    pub fn subscribers(&self, topic: &Topic) -> usize {
        self.lock()
            .map(|s| {
                s.registrations
                    .values()
                    .filter(|r| &r.topic == topic)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.subscribers(topic) > 0
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(&self, topic: Topic, sink: DeliverySink) -> Result<SubscriptionHandle> {
        let mut state = self.lock()?;
        if !state.online {
            return Err(BusError::Offline {
                topic: topic.to_string(),
            });
        }

        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.registrations.insert(
            id,
            Registration {
                topic: topic.clone(),
                sink,
            },
        );

        info!(subscription = %id, topic = %topic, "Subscribed");
        Ok(SubscriptionHandle::new(id, topic))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut state = self.lock()?;
        match state.registrations.remove(&handle.id()) {
            Some(_) => {
                info!(subscription = %handle.id(), topic = %handle.topic(), "Unsubscribed");
                Ok(())
            }
            None => Err(BusError::UnknownSubscription(handle.id())),
        }
    }
}
