//! # ekklesia-shared
//!
//! Identifiers, the inbound event schema and the error types shared by every
//! Ekklesia crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{EventError, SharedError};
pub use protocol::{InboundEvent, MessageRow};
pub use types::{
    ConversationKey, DeliveryState, DirectPair, GroupId, Message, MessageId, Topic, UserId,
};
