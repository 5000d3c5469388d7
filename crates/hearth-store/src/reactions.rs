use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, Connection};

use hearth_shared::{MessageId, UserId};

use crate::database::{parse_uuid, ts_to_sql, Database};
use crate::error::Result;
use crate::models::Reactions;

impl Database {
    /// Add a single reaction.  Adding an existing reaction is a no-op.
    pub fn add_reaction(&self, message_id: &MessageId, user: UserId, emoji: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.as_str(),
                user.to_string(),
                emoji,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn remove_reaction(&self, message_id: &MessageId, user: UserId, emoji: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id.as_str(), user.to_string(), emoji],
        )?;
        Ok(affected > 0)
    }

    pub fn get_reactions_for_message(&self, message_id: &MessageId) -> Result<Reactions> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, emoji FROM reactions
             WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![message_id.as_str()], |row| {
            let user_str: String = row.get(0)?;
            let emoji: String = row.get(1)?;
            Ok((UserId(parse_uuid(0, &user_str)?), emoji))
        })?;

        let mut reactions = Reactions::new();
        for row in rows {
            let (user, emoji) = row?;
            reactions.entry(emoji).or_default().insert(user);
        }
        Ok(reactions)
    }

    /// Get reactions for multiple messages at once.  Messages without
    /// reactions are absent from the map.
    pub fn get_reactions_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Reactions>> {
        let mut map = HashMap::new();
        for id in message_ids {
            let reactions = self.get_reactions_for_message(id)?;
            if !reactions.is_empty() {
                map.insert(id.clone(), reactions);
            }
        }
        Ok(map)
    }
}

/// Replace the full reaction set of a message on an open connection or
/// transaction.
pub(crate) fn replace_reactions(
    conn: &Connection,
    message_id: &MessageId,
    reactions: &Reactions,
) -> Result<()> {
    conn.execute(
        "DELETE FROM reactions WHERE message_id = ?1",
        params![message_id.as_str()],
    )?;

    let now = ts_to_sql(&Utc::now());
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (emoji, users) in reactions {
        for user in users {
            stmt.execute(params![message_id.as_str(), user.to_string(), emoji, now])?;
        }
    }
    Ok(())
}
