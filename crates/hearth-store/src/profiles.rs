//! CRUD operations for [`Profile`] records.

use chrono::Utc;
use rusqlite::params;

use hearth_shared::UserId;

use crate::database::{not_found, parse_uuid, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::Profile;

impl Database {
    /// Insert a profile or replace every field of an existing one.
    pub fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, username, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 username     = excluded.username,
                 avatar_url   = excluded.avatar_url",
            params![
                profile.id.to_string(),
                profile.display_name,
                profile.username,
                profile.avatar_url,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, id: UserId) -> Result<Profile> {
        self.conn()
            .query_row(
                "SELECT id, display_name, username, avatar_url FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_profile,
            )
            .map_err(not_found)
    }

    /// Batch lookup; ids without a row are skipped.
    pub fn get_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>> {
        let mut profiles = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_profile(*id) {
                Ok(profile) => profiles.push(profile),
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(profiles)
    }
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let id_str: String = row.get(0)?;
    Ok(Profile {
        id: UserId(parse_uuid(0, &id_str)?),
        display_name: row.get(1)?,
        username: row.get(2)?,
        avatar_url: row.get(3)?,
    })
}
