//! # ekklesia-store
//!
//! SQLite-backed data store behind the chat engine: message history, the
//! volunteer and staff directories, groups and per-contact read markers.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every model.

pub mod contacts;
pub mod database;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod reads;

mod error;
mod sql;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
