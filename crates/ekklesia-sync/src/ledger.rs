//! Per-conversation message timeline.
//!
//! The ledger owns the optimistic-send protocol: a local send is visible at
//! once as a `Pending` entry keyed by a fresh correlation token, and the
//! server echo carrying that token later turns the same entry into a
//! `Confirmed` one. Inbound rows are reconciled in two steps:
//!
//! 1. a correlation token that matches an outstanding local send confirms
//!    that entry in place;
//! 2. otherwise a permanent id that is already present is a redelivery and
//!    is absorbed;
//! 3. anything else is a new message and is inserted in `created_at` order.
//!
//! Every logical message is therefore rendered at most once, whatever the
//! duplication or ordering of deliveries.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use ekklesia_shared::{ConversationKey, DeliveryState, Message, MessageId, MessageRow, UserId};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Position of an entry: timestamp first, insertion sequence for ties.
type SortKey = (DateTime<Utc>, u64);

/// A send that has been inserted optimistically and must now be handed to
/// the outbound dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub correlation_token: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn message_id(&self) -> MessageId {
        MessageId::Temporary(self.correlation_token)
    }
}

/// What [`Ledger::reconcile`] did with an inbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// An optimistic entry adopted its permanent id.
    Confirmed { token: Uuid, id: String },
    /// The row was already present; nothing changed.
    Duplicate,
    /// A message from another origin was inserted.
    Inserted { id: String },
    /// The row belongs to a different conversation.
    WrongConversation,
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Inserted { .. })
    }
}

#[derive(Debug)]
pub struct Ledger {
    key: ConversationKey,
    entries: BTreeMap<SortKey, Message>,
    by_permanent: HashMap<String, SortKey>,
    /// Tokens of local sends that have not been confirmed (Pending or Failed).
    by_token: HashMap<Uuid, SortKey>,
    next_seq: u64,
}

impl Ledger {
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            entries: BTreeMap::new(),
            by_permanent: HashMap::new(),
            by_token: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    fn sort_key(&mut self, at: DateTime<Utc>) -> SortKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        (at, seq)
    }

    /// Insert a `Pending` message at the tail and return what must be
    /// dispatched.
    ///
    /// The entry is stamped with `now`, or with the newest timestamp already
    /// in the ledger if that is later, so it lands at the tail without
    /// breaking the order invariant.
    pub fn begin_send(&mut self, sender: UserId, body: String, now: DateTime<Utc>) -> OutboundMessage {
        let token = Uuid::new_v4();
        let created_at = match self.entries.last_key_value() {
            Some(((last, _), _)) if *last > now => *last,
            _ => now,
        };
        let sort_key = self.sort_key(created_at);

        let message = Message {
            id: MessageId::Temporary(token),
            conversation_key: self.key.clone(),
            sender_id: sender.clone(),
            body: body.clone(),
            created_at,
            delivery_state: DeliveryState::Pending,
            correlation_token: Some(token),
            confirmed_at: None,
        };
        self.entries.insert(sort_key, message);
        self.by_token.insert(token, sort_key);

        debug!(conversation = %self.key, token = %token, "Optimistic message inserted");

        OutboundMessage {
            conversation_key: self.key.clone(),
            sender_id: sender,
            correlation_token: token,
            body,
            created_at,
        }
    }

    /// Mark a pending send as failed. The message stays in place. Returns
    /// `false` if the token is unknown or the message is no longer pending.
    pub fn mark_failed(&mut self, token: Uuid) -> bool {
        let Some(sort_key) = self.by_token.get(&token) else {
            return false;
        };
        match self.entries.get_mut(sort_key) {
            Some(message) if message.is_pending() => {
                message.delivery_state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Drop a failed message and send its body again under a new token.
    pub fn retry(&mut self, id: &MessageId, now: DateTime<Utc>) -> Result<OutboundMessage> {
        let failed = self.discard_failed(id)?;
        Ok(self.begin_send(failed.sender_id, failed.body, now))
    }

    /// Remove a failed message without resending it.
    pub fn discard_failed(&mut self, id: &MessageId) -> Result<Message> {
        let token = id
            .as_temporary()
            .ok_or_else(|| SyncError::NotRetryable(id.to_string()))?;
        let sort_key = *self
            .by_token
            .get(&token)
            .ok_or_else(|| SyncError::MessageNotFound(id.to_string()))?;

        match self.entries.get(&sort_key) {
            Some(message) if message.is_failed() => {}
            Some(_) => return Err(SyncError::NotRetryable(id.to_string())),
            None => return Err(SyncError::MessageNotFound(id.to_string())),
        }

        self.by_token.remove(&token);
        self.entries
            .remove(&sort_key)
            .ok_or_else(|| SyncError::MessageNotFound(id.to_string()))
    }

    /// Merge one authoritative row into the timeline.
    pub fn reconcile(&mut self, row: &MessageRow) -> Reconciliation {
        if row.conversation_key != self.key {
            return Reconciliation::WrongConversation;
        }

        if let Some(token) = row.correlation_token {
            if let Some(sort_key) = self.by_token.remove(&token) {
                return self.confirm(token, sort_key, row);
            }
        }

        if self.by_permanent.contains_key(&row.id) {
            debug!(conversation = %self.key, message_id = %row.id, "Duplicate delivery absorbed");
            return Reconciliation::Duplicate;
        }

        let sort_key = self.sort_key(row.created_at);
        self.entries.insert(sort_key, row.to_confirmed());
        self.by_permanent.insert(row.id.clone(), sort_key);
        Reconciliation::Inserted { id: row.id.clone() }
    }

    fn confirm(&mut self, token: Uuid, sort_key: SortKey, row: &MessageRow) -> Reconciliation {
        // The permanent id may already be present if the echo was first seen
        // without its token. Keep that copy and drop the optimistic one.
        if self.by_permanent.contains_key(&row.id) {
            self.entries.remove(&sort_key);
            debug!(conversation = %self.key, message_id = %row.id, "Optimistic copy merged into existing message");
            return Reconciliation::Duplicate;
        }

        let Some(message) = self.entries.get_mut(&sort_key) else {
            return Reconciliation::Duplicate;
        };
        message.id = MessageId::Permanent(row.id.clone());
        message.delivery_state = DeliveryState::Confirmed;
        message.confirmed_at = Some(row.created_at);
        self.by_permanent.insert(row.id.clone(), sort_key);

        debug!(conversation = %self.key, token = %token, message_id = %row.id, "Optimistic message confirmed");
        Reconciliation::Confirmed {
            token,
            id: row.id.clone(),
        }
    }

    /// Messages in timeline order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        let sort_key = match id {
            MessageId::Temporary(token) => self.by_token.get(token),
            MessageId::Permanent(id) => self.by_permanent.get(id),
        }?;
        self.entries.get(sort_key)
    }

    /// Index of a message in timeline order.
    pub fn position_of(&self, id: &MessageId) -> Option<usize> {
        let sort_key = match id {
            MessageId::Temporary(token) => self.by_token.get(token),
            MessageId::Permanent(id) => self.by_permanent.get(id),
        }?;
        Some(self.entries.range(..*sort_key).count())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|m| m.is_pending()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.values().filter(|m| m.is_failed()).count()
    }
}
