//! Groups and their flat member lists.

use ekklesia_shared::{GroupId, UserId};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Group;
use crate::sql::{format_ts, parse_ts};

impl Database {
    pub fn create_group(&self, group: &Group, members: &[UserId]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO groups (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![group.id.as_str(), group.name, format_ts(&group.created_at)],
        )?;
        for member in members {
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group.id.as_str(), member.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_group(&self, id: &GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT id, name, created_at FROM groups WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    let id: String = row.get(0)?;
                    let created_at: String = row.get(2)?;
                    Ok(Group {
                        id: GroupId(id),
                        name: row.get(1)?,
                        created_at: parse_ts(2, &created_at)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn group_members(&self, id: &GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| row.get::<_, String>(0))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(UserId(row?));
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_group_with_members() {
        let db = Database::open_in_memory().unwrap();
        let group = Group {
            id: GroupId::new("choir"),
            name: "Choir".into(),
            created_at: Utc::now(),
        };
        let members = vec![UserId::new("bruno"), UserId::new("ana"), UserId::new("ana")];
        db.create_group(&group, &members).unwrap();

        assert_eq!(db.get_group(&group.id).unwrap().name, "Choir");
        assert_eq!(
            db.group_members(&group.id).unwrap(),
            vec![UserId::new("ana"), UserId::new("bruno")]
        );
        assert!(matches!(
            db.get_group(&GroupId::new("missing")),
            Err(StoreError::NotFound)
        ));
    }
}
