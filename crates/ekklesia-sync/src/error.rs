use ekklesia_bus::BusError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Subscription to {topic} failed: {source}")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("No conversation is active")]
    NoActiveConversation,

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message {0} has not failed and cannot be retried")]
    NotRetryable(String),

    #[error("Engine has shut down")]
    EngineClosed,

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),
}

/// Failure reported by an external collaborator (data store, directory,
/// delivery provider).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
