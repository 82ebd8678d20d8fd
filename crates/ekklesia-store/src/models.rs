//! Domain model structs persisted in the local database.

use chrono::{DateTime, Utc};
use ekklesia_shared::{GroupId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

/// The two independently maintained contact directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Directory {
    Volunteers,
    Staff,
}

impl Directory {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Volunteers => "volunteers",
            Self::Staff => "staff",
        }
    }

    pub fn name(self) -> &'static str {
        self.table()
    }
}

/// One person listed in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub user_id: UserId,
    pub display_name: String,
    /// Phone number or messaging address used for outbound delivery.
    pub address: Option<String>,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A group conversation with a flat member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation summary
// ---------------------------------------------------------------------------

/// Latest message and unread count of one direct conversation, as seen by a
/// given user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummaryRow {
    pub peer: UserId,
    pub last_body: String,
    pub last_at: DateTime<Utc>,
    pub unread: u32,
}
