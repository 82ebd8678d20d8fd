//! # ekklesia-sync
//!
//! Real-time message synchronization for Ekklesia chat.
//!
//! Keeps an optimistically updated timeline consistent with the
//! at-least-once event stream of the bus, manages the subscription of the
//! active conversation and of the personal inbox, and maintains the contact
//! roster with its unread counts. [`SyncEngine`] is the synchronous core;
//! [`spawn_engine`] runs it as a tokio task driven by [`EngineHandle`].

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod roster;
pub mod runtime;
pub mod session;
pub mod unread;

mod error;

pub use collaborators::{
    Collaborators, ContactRecord, ContactSource, ConversationSummary, DispatchOutcome,
    DispatchRequest, HistorySource, MessageDispatcher, ReadMarkerSink,
};
pub use config::EngineConfig;
pub use engine::{MarkReadRequest, RosterFetch, RosterOutcome, SyncEngine};
pub use error::{Result, SourceError, SyncError};
pub use ledger::{Ledger, OutboundMessage, Reconciliation};
pub use roster::{Contact, Roster, RosterChange};
pub use runtime::{spawn_engine, EngineCommand, EngineHandle, EngineNotification};
pub use session::{FetchTicket, HistoryOutcome, SessionManager};
pub use unread::UnreadCounter;
