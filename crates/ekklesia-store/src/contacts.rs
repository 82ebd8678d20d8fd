//! CRUD operations for the volunteer and staff directories.

use ekklesia_shared::UserId;
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Directory, DirectoryEntry};
use crate::sql::{format_ts, parse_ts};

impl Database {
    /// Insert or update a directory entry.
    pub fn upsert_contact(&self, directory: Directory, entry: &DirectoryEntry) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO {} (user_id, display_name, address, favorite, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    address = excluded.address,
                    favorite = excluded.favorite",
                directory.table()
            ),
            params![
                entry.user_id.as_str(),
                entry.display_name,
                entry.address,
                entry.favorite as i32,
                format_ts(&entry.created_at),
            ],
        )?;
        Ok(())
    }

    /// All entries of a directory, ordered by display name.
    pub fn list_contacts(&self, directory: Directory) -> Result<Vec<DirectoryEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT user_id, display_name, address, favorite, created_at
             FROM {}
             ORDER BY display_name COLLATE NOCASE ASC",
            directory.table()
        ))?;

        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn get_contact(&self, directory: Directory, user_id: &UserId) -> Result<DirectoryEntry> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT user_id, display_name, address, favorite, created_at
                     FROM {} WHERE user_id = ?1",
                    directory.table()
                ),
                params![user_id.as_str()],
                row_to_entry,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn delete_contact(&self, directory: Directory, user_id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            &format!("DELETE FROM {} WHERE user_id = ?1", directory.table()),
            params![user_id.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectoryEntry> {
    let user_id: String = row.get(0)?;
    let favorite: i32 = row.get(3)?;
    let created_at: String = row.get(4)?;

    Ok(DirectoryEntry {
        user_id: UserId(user_id),
        display_name: row.get(1)?,
        address: row.get(2)?,
        favorite: favorite != 0,
        created_at: parse_ts(4, &created_at)?,
    })
}
