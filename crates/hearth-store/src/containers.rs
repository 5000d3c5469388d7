//! CRUD operations for [`Container`] and [`Membership`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use hearth_shared::{ContainerId, UserId};

use crate::database::{not_found, parse_ts, parse_uuid, ts_to_sql, Database};
use crate::error::Result;
use crate::models::{Container, ContainerKind, Membership};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn create_container(&self, container: &Container) -> Result<()> {
        self.conn().execute(
            "INSERT INTO containers (id, kind, title, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                container.id.to_string(),
                container.kind.as_str(),
                container.title,
                container.avatar_url,
                ts_to_sql(&container.created_at),
            ],
        )?;
        Ok(())
    }

    /// Add `user` to `container`.  Joining twice is a no-op.
    pub fn add_member(&self, container: ContainerId, user: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO memberships (container_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![container.to_string(), user.to_string(), ts_to_sql(&Utc::now())],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_container(&self, id: ContainerId) -> Result<Container> {
        self.conn()
            .query_row(
                "SELECT id, kind, title, avatar_url, created_at FROM containers WHERE id = ?1",
                params![id.to_string()],
                |row| row_to_container(row, 0),
            )
            .map_err(not_found)
    }

    /// Every membership of `user`, with the counterpart of direct
    /// conversations resolved.
    pub fn list_memberships(&self, user: UserId) -> Result<Vec<Membership>> {
        let mut memberships = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.title, c.avatar_url, c.created_at,
                        m.muted, m.archived, m.pinned, m.last_read_at
                 FROM memberships m
                 JOIN containers c ON c.id = m.container_id
                 WHERE m.user_id = ?1
                 ORDER BY c.created_at DESC",
            )?;

            let rows = stmt.query_map(params![user.to_string()], |row| {
                let container = row_to_container(row, 0)?;
                let last_read: Option<String> = row.get(8)?;
                Ok(Membership {
                    container,
                    user_id: user,
                    muted: row.get(5)?,
                    archived: row.get(6)?,
                    pinned: row.get(7)?,
                    last_read_at: last_read.map(|s| parse_ts(8, &s)).transpose()?,
                    counterpart: None,
                })
            })?;

            let mut memberships = Vec::new();
            for row in rows {
                memberships.push(row?);
            }
            memberships
        };

        for membership in memberships.iter_mut() {
            if membership.container.kind == ContainerKind::Direct {
                membership.counterpart = self.counterpart(membership.container.id, user)?;
            }
        }
        Ok(memberships)
    }

    fn counterpart(&self, container: ContainerId, user: UserId) -> Result<Option<UserId>> {
        let other: Option<String> = self
            .conn()
            .query_row(
                "SELECT user_id FROM memberships
                 WHERE container_id = ?1 AND user_id != ?2
                 LIMIT 1",
                params![container.to_string(), user.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(other
            .map(|s| parse_uuid(0, &s).map(UserId))
            .transpose()?)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn set_membership_flags(
        &self,
        container: ContainerId,
        user: UserId,
        muted: bool,
        archived: bool,
        pinned: bool,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE memberships SET muted = ?3, archived = ?4, pinned = ?5
             WHERE container_id = ?1 AND user_id = ?2",
            params![container.to_string(), user.to_string(), muted, archived, pinned],
        )?;
        Ok(affected > 0)
    }

    /// Returns `false` when `user` is not a member of `container`.
    pub fn set_last_read(&self, container: ContainerId, user: UserId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE memberships SET last_read_at = ?3
             WHERE container_id = ?1 AND user_id = ?2",
            params![container.to_string(), user.to_string(), ts_to_sql(&at)],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn delete_container(&self, id: ContainerId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM containers WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map five container columns starting at `start` to a [`Container`].
fn row_to_container(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<Container> {
    let id_str: String = row.get(start)?;
    let kind_str: String = row.get(start + 1)?;
    let created_str: String = row.get(start + 4)?;

    Ok(Container {
        id: ContainerId(parse_uuid(start, &id_str)?),
        kind: ContainerKind::parse(&kind_str).unwrap_or(ContainerKind::Channel),
        title: row.get(start + 2)?,
        avatar_url: row.get(start + 3)?,
        created_at: parse_ts(start + 4, &created_str)?,
    })
}
