use ekklesia_shared::EventError;
use thiserror::Error;

use crate::handle::SubscriptionId;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Event bus is offline, cannot subscribe to {topic}")]
    Offline { topic: String },

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("Event rejected: {0}")]
    Rejected(#[from] EventError),

    #[error("Event bus state lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, BusError>;
