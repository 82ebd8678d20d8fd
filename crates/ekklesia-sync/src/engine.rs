//! The synchronous sync engine.
//!
//! [`SyncEngine`] owns every piece of chat state: the session manager with
//! the active ledger, the roster and the unread counter. It performs no I/O
//! itself. Each operation applies its state change at once and returns the
//! side effects (history fetches, dispatches, remote mark-reads) for the
//! caller to run. [`crate::runtime`] drives it from a single task.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use ekklesia_bus::{Delivery, DeliverySink, EventBus, SubscriptionHandle};
use ekklesia_shared::{ConversationKey, Message, MessageId, MessageRow, UserId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    ContactRecord, ConversationSummary, DispatchOutcome, DispatchRequest,
};
use crate::config::EngineConfig;
use crate::error::{Result, SourceError, SyncError};
use crate::ledger::OutboundMessage;
use crate::roster::{Contact, Roster, RosterChange};
use crate::session::{FetchTicket, HistoryOutcome, RouteOutcome, SessionManager};
use crate::unread::UnreadCounter;

/// A best-effort remote mark-read the caller should issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkReadRequest {
    pub me: UserId,
    pub contact: UserId,
}

#[derive(Debug)]
pub struct StartEffects {
    pub roster_generation: u64,
    pub inbox_error: Option<SyncError>,
}

#[derive(Debug)]
pub struct SelectEffects {
    pub fetch: FetchTicket,
    pub subscription_error: Option<SyncError>,
    pub mark_read: Option<MarkReadRequest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryEffects {
    pub timeline_changed: bool,
    pub roster_changed: bool,
}

/// Results of one full roster fetch.
#[derive(Debug, Clone)]
pub struct RosterFetch {
    /// Contact directories by name, in precedence order.
    pub sources: Vec<(String, std::result::Result<Vec<ContactRecord>, SourceError>)>,
    pub summaries: std::result::Result<Vec<ConversationSummary>, SourceError>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RosterOutcome {
    Stale,
    Applied {
        failed_sources: Vec<(String, SourceError)>,
        summaries_error: Option<SourceError>,
        mark_read: Option<MarkReadRequest>,
    },
}

pub struct SyncEngine {
    me: UserId,
    config: EngineConfig,
    bus: Arc<dyn EventBus>,
    sink: DeliverySink,
    session: SessionManager,
    roster: Roster,
    unread: UnreadCounter,
    /// Contacts read locally whose remote read marker is not confirmed yet.
    unsynced_reads: HashSet<UserId>,
    inbox: Option<SubscriptionHandle>,
    roster_generation: u64,
    closed: bool,
}

impl SyncEngine {
    /// `sink` receives every delivery of every subscription the engine opens.
    pub fn new(config: EngineConfig, me: UserId, bus: Arc<dyn EventBus>, sink: DeliverySink) -> Self {
        let roster = Roster::new(me.clone(), config.dedup_window, config.preview_chars);
        Self {
            me,
            config,
            bus,
            sink,
            session: SessionManager::new(),
            roster,
            unread: UnreadCounter::new(),
            unsynced_reads: HashSet::new(),
            inbox: None,
            roster_generation: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SyncError::EngineClosed)
        } else {
            Ok(())
        }
    }

    /// Open the personal inbox topic and request the first roster fetch.
    pub fn start(&mut self) -> Result<StartEffects> {
        self.ensure_open()?;
        let inbox_error = self.open_inbox().err();
        info!(user = %self.me, "Sync engine started");
        Ok(StartEffects {
            roster_generation: self.begin_roster_refresh(),
            inbox_error,
        })
    }

    fn open_inbox(&mut self) -> Result<()> {
        let topic = self.me.inbox_topic();
        match self.bus.subscribe(topic.clone(), self.sink.clone()) {
            Ok(handle) => {
                self.inbox = Some(handle);
                Ok(())
            }
            Err(source) => {
                warn!(topic = %topic, error = %source, "Inbox subscription failed");
                Err(SyncError::SubscriptionFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Reopen the inbox topic after a failure. On success a roster refresh
    /// generation is returned so the caller can catch up on missed events.
    pub fn retry_inbox(&mut self) -> Result<Option<u64>> {
        self.ensure_open()?;
        if self.inbox.is_some() {
            return Ok(None);
        }
        self.open_inbox()?;
        info!(user = %self.me, "Inbox subscription restored");
        Ok(Some(self.begin_roster_refresh()))
    }

    pub fn select_conversation(&mut self, key: ConversationKey) -> Result<SelectEffects> {
        self.ensure_open()?;
        let selection = self.session.select(key.clone(), self.bus.as_ref(), &self.sink);

        // Opening a direct conversation reads it.
        let mark_read = key.direct_peer(&self.me).cloned().map(|peer| {
            self.unread.mark_read(&peer);
            self.unsynced_reads.insert(peer.clone());
            MarkReadRequest {
                me: self.me.clone(),
                contact: peer,
            }
        });

        Ok(SelectEffects {
            fetch: selection.ticket,
            subscription_error: selection.subscription_error,
            mark_read,
        })
    }

    pub fn close_conversation(&mut self) -> Option<ConversationKey> {
        self.session.deselect(self.bus.as_ref())
    }

    /// Optimistically append `body` to the active conversation.
    pub fn send(&mut self, body: &str) -> Result<DispatchRequest> {
        self.ensure_open()?;
        if body.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let me = self.me.clone();
        let ledger = self
            .session
            .ledger_mut()
            .ok_or(SyncError::NoActiveConversation)?;
        let outbound = ledger.begin_send(me, body.to_string(), Utc::now());
        Ok(self.dispatch_request(outbound))
    }

    /// Replace a failed message with a fresh pending send of the same body.
    pub fn retry(&mut self, id: &MessageId) -> Result<DispatchRequest> {
        self.ensure_open()?;
        let ledger = self
            .session
            .ledger_mut()
            .ok_or(SyncError::NoActiveConversation)?;
        let outbound = ledger.retry(id, Utc::now())?;
        info!(failed = %id, message_id = %outbound.message_id(), "Retrying failed message");
        Ok(self.dispatch_request(outbound))
    }

    fn dispatch_request(&self, outbound: OutboundMessage) -> DispatchRequest {
        let recipient_address = match &outbound.conversation_key {
            ConversationKey::Direct(pair) => {
                let peer = pair.peer_of(&self.me);
                self.roster
                    .address_of(peer)
                    .unwrap_or(peer.as_str())
                    .to_string()
            }
            ConversationKey::Group(id) => id.to_string(),
        };
        DispatchRequest {
            correlation_token: outbound.correlation_token,
            conversation_key: outbound.conversation_key,
            sender_id: outbound.sender_id,
            recipient_address,
            body: outbound.body,
        }
    }

    /// Route one bus delivery to the roster (inbox topic) or the active
    /// ledger (conversation topic).
    pub fn handle_delivery(&mut self, delivery: Delivery) -> DeliveryEffects {
        if self.closed {
            return DeliveryEffects::default();
        }

        let from_inbox = self
            .inbox
            .as_ref()
            .is_some_and(|h| h.id() == delivery.subscription);
        if from_inbox {
            let change = self.roster.apply_inbound(
                delivery.event.row(),
                self.session.active_key(),
                &mut self.unread,
            );
            return DeliveryEffects {
                timeline_changed: false,
                roster_changed: matches!(change, RosterChange::Updated { .. }),
            };
        }

        match self.session.route(delivery) {
            RouteOutcome::Applied(reconciliation) => DeliveryEffects {
                timeline_changed: reconciliation.changed(),
                roster_changed: false,
            },
            RouteOutcome::Buffered | RouteOutcome::Ignored => DeliveryEffects::default(),
        }
    }

    pub fn history_loaded(
        &mut self,
        generation: u64,
        result: std::result::Result<Vec<MessageRow>, SourceError>,
    ) -> HistoryOutcome {
        self.session.history_loaded(generation, result)
    }

    /// Record the outcome of a dispatch. Returns the id of the message that
    /// became `Failed`, if any.
    pub fn dispatch_completed(
        &mut self,
        key: &ConversationKey,
        token: Uuid,
        outcome: DispatchOutcome,
    ) -> Option<MessageId> {
        let DispatchOutcome::Failed { reason } = outcome else {
            debug!(token = %token, "Dispatch accepted, awaiting echo");
            return None;
        };
        warn!(conversation = %key, token = %token, reason = %reason, "Dispatch failed");

        let ledger = self.session.ledger_for_mut(key)?;
        ledger
            .mark_failed(token)
            .then_some(MessageId::Temporary(token))
    }

    /// Start a full roster refresh. Results tagged with an older generation
    /// are discarded by [`SyncEngine::roster_loaded`].
    pub fn begin_roster_refresh(&mut self) -> u64 {
        self.roster_generation += 1;
        self.roster_generation
    }

    pub fn roster_loaded(&mut self, generation: u64, fetch: RosterFetch) -> RosterOutcome {
        if self.closed || generation != self.roster_generation {
            debug!(generation, "Discarding stale roster result");
            return RosterOutcome::Stale;
        }

        let mut directories = Vec::new();
        let mut failed_sources = Vec::new();
        for (name, result) in fetch.sources {
            match result {
                Ok(records) => directories.push(records),
                Err(error) => {
                    warn!(source = %name, error = %error, "Contact source failed");
                    failed_sources.push((name, error));
                }
            }
        }

        let (summaries, summaries_error) = match fetch.summaries {
            Ok(summaries) => (Some(summaries), None),
            Err(error) => {
                warn!(error = %error, "Conversation summaries failed");
                (None, Some(error))
            }
        };

        self.roster.load(directories, summaries, &mut self.unread);

        // A refreshed count for the conversation on screen is read already.
        let active_peer = self
            .session
            .active_key()
            .and_then(|key| key.direct_peer(&self.me))
            .filter(|peer| self.unread.count(peer) > 0)
            .cloned();
        let mark_read = active_peer.and_then(|peer| self.mark_read(&peer));

        RosterOutcome::Applied {
            failed_sources,
            summaries_error,
            mark_read,
        }
    }

    /// Zero `contact`'s unread count. A remote mark-read is requested while
    /// there was something to clear or an earlier remote call has not been
    /// confirmed by [`SyncEngine::mark_read_synced`].
    pub fn mark_read(&mut self, contact: &UserId) -> Option<MarkReadRequest> {
        if self.unread.mark_read(contact) > 0 {
            self.unsynced_reads.insert(contact.clone());
        }
        self.unsynced_reads
            .contains(contact)
            .then(|| MarkReadRequest {
                me: self.me.clone(),
                contact: contact.clone(),
            })
    }

    /// The remote read marker for `contact` was stored.
    pub fn mark_read_synced(&mut self, contact: &UserId) {
        self.unsynced_reads.remove(contact);
    }

    /// Whether a local mark-read of `contact` still awaits remote confirmation.
    pub fn is_read_unsynced(&self, contact: &UserId) -> bool {
        self.unsynced_reads.contains(contact)
    }

    pub fn retry_subscription(&mut self, generation: u64) -> Result<Option<FetchTicket>> {
        self.ensure_open()?;
        self.session
            .retry_subscription(generation, self.bus.as_ref(), &self.sink)
    }

    /// Release every subscription. Later operations fail with
    /// [`SyncError::EngineClosed`] and deliveries are ignored.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.deselect(self.bus.as_ref());
        if let Some(handle) = self.inbox.take() {
            if let Err(e) = self.bus.unsubscribe(handle) {
                warn!(error = %e, "Releasing inbox subscription failed");
            }
        }
        info!(user = %self.me, "Sync engine stopped");
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn active_conversation(&self) -> Option<&ConversationKey> {
        self.session.active_key()
    }

    /// Generation of the active selection.
    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    pub fn timeline(&self) -> Vec<Message> {
        self.session
            .ledger()
            .map(|ledger| ledger.snapshot())
            .unwrap_or_default()
    }

    pub fn roster(&self) -> Vec<Contact> {
        self.roster.snapshot(&self.unread)
    }

    pub fn unread_count(&self, contact: &UserId) -> u32 {
        self.unread.count(contact)
    }

    pub fn unread_total(&self) -> u32 {
        self.unread.total()
    }

    pub fn is_live(&self) -> bool {
        self.session.is_live()
    }

    pub fn is_conversation_subscribed(&self) -> bool {
        self.session.is_subscribed()
    }

    pub fn is_inbox_subscribed(&self) -> bool {
        self.inbox.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
