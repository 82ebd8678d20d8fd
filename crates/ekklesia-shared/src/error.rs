use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid conversation key: {0}")]
    InvalidConversationKey(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid message id: {0}")]
    InvalidId(String),
}

/// Rejections raised while validating inbound event payloads.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event row is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Event for {key} does not belong on topic {topic}")]
    TopicMismatch { topic: String, key: String },
}
