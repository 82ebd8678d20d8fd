//! Contracts of the external collaborators the engine drives: the outbound
//! delivery provider, the data store and the contact directories.
//!
//! Every call returns a boxed `'static` future so implementations can be
//! shared as trait objects and spawned onto the runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ekklesia_shared::{ConversationKey, MessageRow, UserId};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SourceError;

/// One send handed to the delivery provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Temporary id of the optimistic copy; echoed back by the backend.
    pub correlation_token: Uuid,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    /// Phone number or channel address of the recipient, or the group id.
    pub recipient_address: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Failed { reason: String },
}

/// Fire-and-forget outbound delivery. Failures are terminal for the attempt.
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'static, DispatchOutcome>;
}

/// Roster entry as provided by one contact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: UserId,
    pub display_name: String,
    pub address: Option<String>,
    pub favorite: bool,
}

/// Last message and unread count of one direct conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub contact_id: UserId,
    pub last_body: String,
    pub last_at: DateTime<Utc>,
    pub unread: u32,
}

pub trait HistorySource: Send + Sync {
    /// Messages of a conversation in ascending `created_at` order.
    fn fetch_history(
        &self,
        key: ConversationKey,
    ) -> BoxFuture<'static, Result<Vec<MessageRow>, SourceError>>;

    fn fetch_summaries(
        &self,
        me: UserId,
    ) -> BoxFuture<'static, Result<Vec<ConversationSummary>, SourceError>>;
}

pub trait ContactSource: Send + Sync {
    /// Used in logs and failure notifications.
    fn name(&self) -> &str;

    fn fetch_contacts(&self) -> BoxFuture<'static, Result<Vec<ContactRecord>, SourceError>>;
}

/// Best-effort propagation of a local mark-read to the backing store.
pub trait ReadMarkerSink: Send + Sync {
    fn mark_read_remote(&self, me: UserId, contact: UserId)
        -> BoxFuture<'static, Result<(), SourceError>>;
}

/// Everything the runtime needs to reach the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub history: Arc<dyn HistorySource>,
    /// Contact directories in precedence order: on a duplicate identity the
    /// earlier source wins for display fields.
    pub contact_sources: Vec<Arc<dyn ContactSource>>,
    pub read_markers: Arc<dyn ReadMarkerSink>,
}
