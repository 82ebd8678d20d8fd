//! Active-conversation tracking and its subscription lifecycle.
//!
//! At most one conversation is active. Selecting one releases the previous
//! conversation's topic, drops its ledger and opens a fresh subscription.
//! Every selection is tagged with a generation number; history results that
//! carry an older generation are discarded. Live events that arrive before
//! the history fetch resolves are buffered and replayed on top of it.

use ekklesia_bus::{Delivery, DeliverySink, EventBus, SubscriptionHandle};
use ekklesia_shared::{ConversationKey, MessageRow};
use tracing::{debug, info, warn};

use crate::error::{Result, SourceError, SyncError};
use crate::ledger::{Ledger, Reconciliation};

/// A history fetch the caller must perform for the active conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub key: ConversationKey,
}

#[derive(Debug)]
pub struct Selection {
    pub ticket: FetchTicket,
    /// Set when the topic could not be opened; the conversation is
    /// history-only until a retry succeeds.
    pub subscription_error: Option<SyncError>,
    /// Conversation whose subscription was released by this selection.
    pub released: Option<ConversationKey>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// The result belongs to a superseded selection.
    Stale,
    Applied { inserted: usize, replayed: usize },
    /// The fetch failed; buffered events were still applied.
    Failed { key: ConversationKey, error: SourceError },
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied(Reconciliation),
    /// Held until the history fetch resolves.
    Buffered,
    /// Not from the active conversation's subscription.
    Ignored,
}

#[derive(Debug)]
enum Phase {
    Loading { buffer: Vec<MessageRow> },
    Live,
}

#[derive(Debug)]
struct ActiveConversation {
    key: ConversationKey,
    generation: u64,
    handle: Option<SubscriptionHandle>,
    ledger: Ledger,
    phase: Phase,
}

impl ActiveConversation {
    fn begin_loading(&mut self, generation: u64) -> FetchTicket {
        self.generation = generation;
        if matches!(self.phase, Phase::Live) {
            self.phase = Phase::Loading { buffer: Vec::new() };
        }
        FetchTicket {
            generation,
            key: self.key.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionManager {
    generation: u64,
    active: Option<ActiveConversation>,
}

fn open(
    key: &ConversationKey,
    bus: &dyn EventBus,
    sink: &DeliverySink,
) -> std::result::Result<SubscriptionHandle, SyncError> {
    let topic = key.to_topic();
    bus.subscribe(topic.clone(), sink.clone())
        .map_err(|source| SyncError::SubscriptionFailed {
            topic: topic.to_string(),
            source,
        })
}

fn release(bus: &dyn EventBus, handle: SubscriptionHandle) {
    let id = handle.id();
    if let Err(e) = bus.unsubscribe(handle) {
        warn!(subscription = %id, error = %e, "Releasing subscription failed");
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Make `key` the active conversation.
    ///
    /// Re-selecting the active conversation keeps its subscription and its
    /// ledger and only starts a new history fetch.
    pub fn select(
        &mut self,
        key: ConversationKey,
        bus: &dyn EventBus,
        sink: &DeliverySink,
    ) -> Selection {
        let generation = self.next_generation();

        if let Some(active) = self.active.as_mut().filter(|a| a.key == key) {
            let mut subscription_error = None;
            if active.handle.is_none() {
                match open(&key, bus, sink) {
                    Ok(handle) => active.handle = Some(handle),
                    Err(e) => subscription_error = Some(e),
                }
            }
            debug!(conversation = %key, generation, "Refreshing active conversation");
            return Selection {
                ticket: active.begin_loading(generation),
                subscription_error,
                released: None,
            };
        }

        let released = self.release_active(bus);

        let (handle, subscription_error) = match open(&key, bus, sink) {
            Ok(handle) => (Some(handle), None),
            Err(e) => {
                warn!(conversation = %key, error = %e, "Conversation is history-only until resubscribed");
                (None, Some(e))
            }
        };

        info!(conversation = %key, generation, "Conversation selected");
        self.active = Some(ActiveConversation {
            key: key.clone(),
            generation,
            handle,
            ledger: Ledger::new(key.clone()),
            phase: Phase::Loading { buffer: Vec::new() },
        });

        Selection {
            ticket: FetchTicket { generation, key },
            subscription_error,
            released,
        }
    }

    fn release_active(&mut self, bus: &dyn EventBus) -> Option<ConversationKey> {
        let previous = self.active.take()?;
        if let Some(handle) = previous.handle {
            release(bus, handle);
        }
        info!(conversation = %previous.key, "Conversation released");
        Some(previous.key)
    }

    /// Drop the active conversation, its subscription and its ledger.
    /// Outstanding history fetches become stale.
    pub fn deselect(&mut self, bus: &dyn EventBus) -> Option<ConversationKey> {
        self.next_generation();
        self.release_active(bus)
    }

    /// Seed the ledger with a history result, then replay buffered events.
    pub fn history_loaded(
        &mut self,
        generation: u64,
        result: std::result::Result<Vec<MessageRow>, SourceError>,
    ) -> HistoryOutcome {
        let Some(active) = self.active.as_mut().filter(|a| a.generation == generation) else {
            debug!(generation, "Discarding stale history result");
            return HistoryOutcome::Stale;
        };

        let buffer = match std::mem::replace(&mut active.phase, Phase::Live) {
            Phase::Loading { buffer } => buffer,
            Phase::Live => Vec::new(),
        };

        let mut inserted = 0;
        let outcome_error = match result {
            Ok(rows) => {
                for row in &rows {
                    if active.ledger.reconcile(row).changed() {
                        inserted += 1;
                    }
                }
                None
            }
            Err(error) => {
                warn!(conversation = %active.key, error = %error, "History fetch failed");
                Some(error)
            }
        };

        let replayed = buffer
            .iter()
            .filter(|row| active.ledger.reconcile(row).changed())
            .count();

        debug!(
            conversation = %active.key,
            generation,
            inserted,
            replayed,
            "Conversation is live"
        );

        match outcome_error {
            Some(error) => HistoryOutcome::Failed {
                key: active.key.clone(),
                error,
            },
            None => HistoryOutcome::Applied { inserted, replayed },
        }
    }

    /// Apply a delivery from the event bus to the active ledger.
    pub fn route(&mut self, delivery: Delivery) -> RouteOutcome {
        let Some(active) = self.active.as_mut() else {
            return RouteOutcome::Ignored;
        };
        let held = active
            .handle
            .as_ref()
            .is_some_and(|h| h.id() == delivery.subscription);
        if !held {
            debug!(subscription = %delivery.subscription, "Delivery for a released subscription ignored");
            return RouteOutcome::Ignored;
        }

        match &mut active.phase {
            Phase::Loading { buffer } => {
                buffer.push(delivery.event.into_row());
                RouteOutcome::Buffered
            }
            Phase::Live => RouteOutcome::Applied(active.ledger.reconcile(delivery.event.row())),
        }
    }

    /// Try again to open the active conversation's topic after a failure.
    ///
    /// On success a new history fetch is requested to catch up with events
    /// published while no subscription was open. Returns `Ok(None)` when
    /// `generation` is stale or the subscription is already open.
    pub fn retry_subscription(
        &mut self,
        generation: u64,
        bus: &dyn EventBus,
        sink: &DeliverySink,
    ) -> Result<Option<FetchTicket>> {
        let current = self.generation;
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };
        if active.generation != generation || active.handle.is_some() {
            return Ok(None);
        }

        let handle = open(&active.key, bus, sink)?;
        active.handle = Some(handle);
        let generation = current + 1;
        self.generation = generation;
        info!(conversation = %active.key, generation, "Conversation subscription restored");
        Ok(Some(active.begin_loading(generation)))
    }

    pub fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|a| &a.key)
    }

    /// Generation of the active selection, or of the last deselection.
    pub fn generation(&self) -> u64 {
        self.active.as_ref().map_or(self.generation, |a| a.generation)
    }

    pub fn ledger(&self) -> Option<&Ledger> {
        self.active.as_ref().map(|a| &a.ledger)
    }

    pub fn ledger_mut(&mut self) -> Option<&mut Ledger> {
        self.active.as_mut().map(|a| &mut a.ledger)
    }

    /// The active ledger, provided it belongs to `key`.
    pub fn ledger_for_mut(&mut self, key: &ConversationKey) -> Option<&mut Ledger> {
        self.active
            .as_mut()
            .filter(|a| &a.key == key)
            .map(|a| &mut a.ledger)
    }

    pub fn is_live(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| matches!(a.phase, Phase::Live))
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.handle.is_some())
    }
}
