//! Message history and per-peer conversation summaries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ekklesia_shared::{ConversationKey, MessageRow, UserId};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::ConversationSummaryRow;
use crate::sql::{conversion_error, format_ts, parse_ts};

const MESSAGE_COLUMNS: &str =
    "id, conversation_key, sender_id, body, created_at, correlation_token";

impl Database {
    /// Insert a committed message. Returns `false` if a message with the same
    /// permanent id already exists.
    pub fn insert_message(&self, row: &MessageRow) -> Result<bool> {
        let (participant_a, participant_b) = match row.conversation_key.as_direct() {
            Some(pair) => {
                let (a, b) = pair.participants();
                (Some(a.to_string()), Some(b.to_string()))
            }
            None => (None, None),
        };

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                (id, conversation_key, participant_a, participant_b, sender_id, body,
                 created_at, correlation_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.conversation_key.to_string(),
                participant_a,
                participant_b,
                row.sender_id.as_str(),
                row.body,
                format_ts(&row.created_at),
                row.correlation_token.map(|t| t.to_string()),
            ],
        )?;
        Ok(affected > 0)
    }

    /// The most recent `limit` messages of a conversation, oldest first.
    pub fn messages_for_conversation(
        &self,
        key: &ConversationKey,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_key = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![key.to_string(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message(&self, id: &str) -> Result<MessageRow> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Last message and unread count for every direct conversation `me`
    /// takes part in. A message is unread when the peer sent it after `me`'s
    /// read marker for that peer.
    pub fn conversation_summaries(&self, me: &UserId) -> Result<Vec<ConversationSummaryRow>> {
        let markers = self.read_markers(me)?;

        let mut stmt = self.conn().prepare(
            "SELECT participant_a, participant_b, sender_id, body, created_at
             FROM messages
             WHERE participant_a = ?1 OR participant_b = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![me.as_str()], |row| {
            let a: String = row.get(0)?;
            let b: String = row.get(1)?;
            let sender: String = row.get(2)?;
            let body: String = row.get(3)?;
            let ts: String = row.get(4)?;
            Ok((a, b, sender, body, parse_ts(4, &ts)?))
        })?;

        let mut summaries: HashMap<UserId, ConversationSummaryRow> = HashMap::new();
        for row in rows {
            let (a, b, sender, body, created_at) = row?;
            let peer = if a == me.as_str() { UserId(b) } else { UserId(a) };

            let read_at: Option<&DateTime<Utc>> = markers.get(&peer);
            let unread_inc = u32::from(
                sender == peer.as_str() && sender != me.as_str()
                    && read_at.map_or(true, |at| created_at > *at),
            );

            let entry = summaries
                .entry(peer.clone())
                .or_insert_with(|| ConversationSummaryRow {
                    peer,
                    last_body: String::new(),
                    last_at: created_at,
                    unread: 0,
                });
            entry.last_body = body;
            entry.last_at = created_at;
            entry.unread += unread_inc;
        }

        let mut out: Vec<ConversationSummaryRow> = summaries.into_values().collect();
        out.sort_by(|x, y| y.last_at.cmp(&x.last_at));
        Ok(out)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: String = row.get(0)?;
    let key_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let body: String = row.get(3)?;
    let ts_str: String = row.get(4)?;
    let token_str: Option<String> = row.get(5)?;

    let conversation_key: ConversationKey =
        key_str.parse().map_err(|e| conversion_error(1, e))?;
    let correlation_token = token_str
        .map(|t| Uuid::parse_str(&t))
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    Ok(MessageRow {
        id,
        conversation_key,
        sender_id: UserId(sender),
        body,
        created_at: parse_ts(4, &ts_str)?,
        correlation_token,
    })
}
