use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;

// Identities come from the auth backend as opaque strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn inbox_topic(&self) -> Topic {
        Topic::Inbox(self.clone())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two participants of a direct conversation, stored in sorted order so
/// that both sides derive the same key (and therefore the same topic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectPair {
    low: UserId,
    high: UserId,
}

impl DirectPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// The participant that is not `me`. A self-conversation yields `me`.
    pub fn peer_of(&self, me: &UserId) -> &UserId {
        if &self.low == me {
            &self.high
        } else {
            &self.low
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }
}

/// Identifies the conversation that owns a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConversationKey {
    Direct(DirectPair),
    Group(GroupId),
}

impl ConversationKey {
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self::Direct(DirectPair::new(a, b))
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::Group(GroupId::new(id))
    }

    pub fn as_direct(&self) -> Option<&DirectPair> {
        match self {
            Self::Direct(pair) => Some(pair),
            Self::Group(_) => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Peer that keys this conversation from `me`'s point of view.
    pub fn direct_peer(&self, me: &UserId) -> Option<&UserId> {
        self.as_direct().map(|pair| pair.peer_of(me))
    }

    pub fn to_topic(&self) -> Topic {
        Topic::Conversation(self.clone())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(pair) => write!(f, "direct:{}:{}", pair.low, pair.high),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SharedError::InvalidConversationKey(s.to_string());

        match s.split_once(':') {
            Some(("direct", rest)) => {
                let (a, b) = rest.split_once(':').ok_or_else(invalid)?;
                if !valid_segment(a) || !valid_segment(b) {
                    return Err(invalid());
                }
                Ok(Self::direct(UserId::new(a), UserId::new(b)))
            }
            Some(("group", id)) if valid_segment(id) => Ok(Self::group(id)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for ConversationKey {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.to_string()
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains(':') && !s.chars().any(char::is_whitespace)
}

/// A named channel on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(ConversationKey),
    Inbox(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(key) => write!(f, "{key}"),
            Self::Inbox(user) => write!(f, "inbox:{user}"),
        }
    }
}

impl FromStr for Topic {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("inbox", user)) if valid_segment(user) => Ok(Self::Inbox(UserId::new(user))),
            Some(("inbox", _)) => Err(SharedError::InvalidTopic(s.to_string())),
            _ => s
                .parse::<ConversationKey>()
                .map(Self::Conversation)
                .map_err(|_| SharedError::InvalidTopic(s.to_string())),
        }
    }
}

/// Current identity of a message: client-generated until the server
/// confirms it, server-assigned afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Temporary(Uuid),
    Permanent(String),
}

impl MessageId {
    pub fn fresh_temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub fn as_permanent(&self) -> Option<&str> {
        match self {
            Self::Permanent(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }

    pub fn as_temporary(&self) -> Option<Uuid> {
        match self {
            Self::Temporary(token) => Some(*token),
            Self::Permanent(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(token) => write!(f, "tmp-{token}"),
            Self::Permanent(id) => f.write_str(id),
        }
    }
}

impl FromStr for MessageId {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(token) = s.strip_prefix("tmp-") {
            return Uuid::parse_str(token)
                .map(Self::Temporary)
                .map_err(|_| SharedError::InvalidId(s.to_string()));
        }
        if s.trim().is_empty() {
            return Err(SharedError::InvalidId(s.to_string()));
        }
        Ok(Self::Permanent(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// One chat message as held by a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender_id: UserId,
    pub body: String,
    /// Ordering timestamp. For locally sent messages this is the local clock
    /// at send time and it is kept after confirmation.
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    /// Temporary id the sender attached, if any.
    pub correlation_token: Option<Uuid>,
    /// Server timestamp, once known.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.delivery_state == DeliveryState::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_pair_is_canonical() {
        let a = UserId::new("ana");
        let b = UserId::new("bruno");

        let k1 = ConversationKey::direct(a.clone(), b.clone());
        let k2 = ConversationKey::direct(b.clone(), a.clone());
        assert_eq!(k1, k2);
        assert_eq!(k1.to_string(), "direct:ana:bruno");
        assert_eq!(k1.direct_peer(&a), Some(&b));
        assert_eq!(k1.direct_peer(&b), Some(&a));
    }

    #[test]
    fn test_conversation_key_parse() {
        let key: ConversationKey = "group:choir".parse().unwrap();
        assert_eq!(key, ConversationKey::group("choir"));
        assert!(key.is_group());

        assert!("direct:ana".parse::<ConversationKey>().is_err());
        assert!("direct:ana:bruno:carla".parse::<ConversationKey>().is_err());
        assert!("group:".parse::<ConversationKey>().is_err());
        assert!("channel:x".parse::<ConversationKey>().is_err());
    }

    #[test]
    fn test_topic_parse() {
        let inbox: Topic = "inbox:ana".parse().unwrap();
        assert_eq!(inbox, UserId::new("ana").inbox_topic());

        let conv: Topic = "direct:bruno:ana".parse().unwrap();
        assert_eq!(conv.to_string(), "direct:ana:bruno");

        assert!("inbox:".parse::<Topic>().is_err());
    }

    #[test]
    fn test_message_id_display_parse() {
        let tmp = MessageId::fresh_temporary();
        let parsed: MessageId = tmp.to_string().parse().unwrap();
        assert_eq!(parsed, tmp);
        assert!(parsed.is_temporary());

        let perm: MessageId = "42".parse().unwrap();
        assert_eq!(perm.as_permanent(), Some("42"));
        assert!("tmp-nope".parse::<MessageId>().is_err());
    }
}
