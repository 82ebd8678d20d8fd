use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventError;
use crate::types::{ConversationKey, DeliveryState, Message, MessageId, Topic, UserId};

/// A committed message row as pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    /// Server-assigned permanent id.
    pub id: String,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Temporary id the sender used for its optimistic copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<Uuid>,
}

impl MessageRow {
    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.trim().is_empty() {
            return Err(EventError::MissingField("id"));
        }
        if self.sender_id.as_str().trim().is_empty() {
            return Err(EventError::MissingField("senderId"));
        }
        if self.body.is_empty() {
            return Err(EventError::MissingField("body"));
        }
        Ok(())
    }

    /// The confirmed timeline entry this row represents.
    pub fn to_confirmed(&self) -> Message {
        Message {
            id: MessageId::Permanent(self.id.clone()),
            conversation_key: self.conversation_key.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
            delivery_state: DeliveryState::Confirmed,
            correlation_token: self.correlation_token,
            confirmed_at: Some(self.created_at),
        }
    }
}

/// Change events delivered by the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundEvent {
    Insert { row: MessageRow },
}

impl InboundEvent {
    pub fn insert(row: MessageRow) -> Self {
        Self::Insert { row }
    }

    /// Parse and validate a raw payload. Anything that fails here never
    /// reaches a timeline.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        let event: Self = serde_json::from_str(raw)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        match self {
            Self::Insert { row } => row.validate(),
        }
    }

    /// Check that the event belongs on `topic`: conversation topics carry only
    /// their own conversation, inbox topics only direct messages involving the
    /// inbox owner.
    pub fn validate_for(&self, topic: &Topic) -> Result<(), EventError> {
        self.validate()?;
        let key = self.conversation_key();
        let matches = match topic {
            Topic::Conversation(expected) => expected == key,
            Topic::Inbox(user) => key.as_direct().is_some_and(|pair| pair.contains(user)),
        };
        if matches {
            Ok(())
        } else {
            Err(EventError::TopicMismatch {
                topic: topic.to_string(),
                key: key.to_string(),
            })
        }
    }

    pub fn row(&self) -> &MessageRow {
        match self {
            Self::Insert { row } => row,
        }
    }

    pub fn into_row(self) -> MessageRow {
        match self {
            Self::Insert { row } => row,
        }
    }

    pub fn conversation_key(&self) -> &ConversationKey {
        &self.row().conversation_key
    }
}
