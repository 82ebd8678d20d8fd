//! v001 -- Initial schema creation.
//!
//! Creates the two contact directories (`volunteers`, `staff`), `messages`,
//! `groups` with `group_members`, and `read_markers`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Contact directories
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS volunteers (
    user_id      TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    address      TEXT,                        -- phone / messaging address
    favorite     INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at   TEXT NOT NULL                -- RFC-3339
);

CREATE TABLE IF NOT EXISTS staff (
    user_id      TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    address      TEXT,
    favorite     INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY NOT NULL,  -- permanent id
    conversation_key  TEXT NOT NULL,              -- direct:<a>:<b> | group:<id>
    participant_a     TEXT,                       -- direct conversations only
    participant_b     TEXT,
    sender_id         TEXT NOT NULL,
    body              TEXT NOT NULL,
    created_at        TEXT NOT NULL,              -- RFC-3339, UTC, fixed precision
    correlation_token TEXT                        -- sender's temporary id
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_key, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_participants
    ON messages(participant_a, participant_b);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    user_id  TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Read markers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS read_markers (
    user_id    TEXT NOT NULL,
    contact_id TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (user_id, contact_id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
