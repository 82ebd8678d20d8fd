//! Per-contact read markers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ekklesia_shared::UserId;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::sql::{format_ts, parse_ts};

impl Database {
    /// Record that `me` has read everything from `contact` up to `at`.
    /// Markers never move backwards.
    pub fn mark_read(&self, me: &UserId, contact: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO read_markers (user_id, contact_id, read_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, contact_id)
             DO UPDATE SET read_at = MAX(read_at, excluded.read_at)",
            params![me.as_str(), contact.as_str(), format_ts(&at)],
        )?;
        Ok(())
    }

    pub fn read_marker(&self, me: &UserId, contact: &UserId) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn()
            .query_row(
                "SELECT read_at FROM read_markers WHERE user_id = ?1 AND contact_id = ?2",
                params![me.as_str(), contact.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.map(|v| parse_ts(0, &v)).transpose()?)
    }

    pub fn read_markers(&self, me: &UserId) -> Result<HashMap<UserId, DateTime<Utc>>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT contact_id, read_at FROM read_markers WHERE user_id = ?1")?;

        let rows = stmt.query_map(params![me.as_str()], |row| {
            let contact: String = row.get(0)?;
            let read_at: String = row.get(1)?;
            Ok((UserId(contact), parse_ts(1, &read_at)?))
        })?;

        let mut markers = HashMap::new();
        for row in rows {
            let (contact, at) = row?;
            markers.insert(contact, at);
        }
        Ok(markers)
    }
}
