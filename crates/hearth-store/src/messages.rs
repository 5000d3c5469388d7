use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use hearth_shared::{ContainerId, MessageId, UserId};

use crate::database::{not_found, parse_ts, parse_uuid, ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::{MediaKind, MediaRef, MessagePatch, MessageQuery, MessageRow, Reactions};
use crate::reactions::replace_reactions;

const MESSAGE_COLUMNS: &str = "id, container_id, author_id, body, media_url, media_kind, reply_to,
     created_at, updated_at, edited, pinned";

impl Database {
    /// Insert a message, assigning it a durable UUID.
    pub fn insert_message(&self, message: &crate::models::NewMessage) -> Result<MessageRow> {
        let id = MessageId::durable(Uuid::new_v4().to_string());
        let updated_at = Utc::now();

        self.conn().execute(
            "INSERT INTO messages (id, container_id, author_id, body, media_url, media_kind,
                                   reply_to, created_at, updated_at, edited, pinned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0)",
            params![
                id.as_str(),
                message.container_id.to_string(),
                message.author_id.to_string(),
                message.body,
                message.media.as_ref().map(|m| m.url.clone()),
                message.media.as_ref().map(|m| m.kind.as_str()),
                message.reply_to.as_ref().map(|r| r.as_str().to_string()),
                ts_to_sql(&message.created_at),
                ts_to_sql(&updated_at),
            ],
        )?;

        tracing::debug!(msg_id = %id, container = %message.container_id, "message inserted");

        Ok(MessageRow {
            id,
            container_id: message.container_id,
            author_id: message.author_id,
            body: message.body.clone(),
            media: message.media.clone(),
            reply_to: message.reply_to.clone(),
            created_at: message.created_at,
            updated_at,
            edited: false,
            pinned: false,
            reactions: Reactions::new(),
        })
    }

    /// The newest `query.limit` rows of a container, returned oldest first.
    pub fn get_messages_for_container(&self, query: &MessageQuery) -> Result<Vec<MessageRow>> {
        let mut messages = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE container_id = ?1 AND (?2 = 0 OR pinned = 1)
                 ORDER BY created_at DESC
                 LIMIT ?3"
            ))?;

            let rows = stmt.query_map(
                params![query.container_id.to_string(), query.pinned_only, query.limit],
                row_to_message,
            )?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            messages
        };

        messages.reverse();
        self.attach_reactions(&mut messages)?;
        Ok(messages)
    }

    pub fn get_messages_by_ids(&self, ids: &[MessageId]) -> Result<Vec<MessageRow>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_message_by_id(id) {
                Ok(message) => messages.push(message),
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(messages)
    }

    pub fn get_message_by_id(&self, id: &MessageId) -> Result<MessageRow> {
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.as_str()],
                row_to_message,
            )
            .map_err(not_found)?;

        message.reactions = self.get_reactions_for_message(id)?;
        Ok(message)
    }

    pub fn last_message_for_container(&self, container: ContainerId) -> Result<Option<MessageRow>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE container_id = ?1
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![container.to_string()],
                row_to_message,
            )
            .optional()?;

        match message {
            Some(mut message) => {
                message.reactions = self.get_reactions_for_message(&message.id)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Apply `patch` in a single transaction and return the fresh row.
    pub fn update_message(&self, id: &MessageId, patch: &MessagePatch) -> Result<MessageRow> {
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;

            let affected = tx.execute(
                "UPDATE messages SET updated_at = ?2 WHERE id = ?1",
                params![id.as_str(), ts_to_sql(&Utc::now())],
            )?;
            if affected == 0 {
                return Err(StoreError::NotFound);
            }

            if let Some(body) = &patch.body {
                tx.execute(
                    "UPDATE messages SET body = ?2, edited = 1 WHERE id = ?1",
                    params![id.as_str(), body],
                )?;
            }

            if let Some(pinned) = patch.pinned {
                tx.execute(
                    "UPDATE messages SET pinned = ?2 WHERE id = ?1",
                    params![id.as_str(), pinned],
                )?;
            }

            if let Some(reactions) = &patch.reactions {
                replace_reactions(&tx, id, reactions)?;
            }

            tx.commit()?;
        }

        self.get_message_by_id(id)
    }

    /// Delete a message.  Returns `true` if a row was deleted.
    pub fn delete_message(&self, id: &MessageId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    /// Messages in `container` written by someone other than `user` after `since`.
    pub fn count_unread_since(
        &self,
        container: ContainerId,
        user: UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE container_id = ?1
               AND author_id != ?2
               AND (?3 IS NULL OR created_at > ?3)",
            params![
                container.to_string(),
                user.to_string(),
                since.as_ref().map(ts_to_sql),
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn attach_reactions(&self, messages: &mut [MessageRow]) -> Result<()> {
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
        let mut reactions = self.get_reactions_for_messages(&ids)?;
        for message in messages.iter_mut() {
            if let Some(set) = reactions.remove(&message.id) {
                message.reactions = set;
            }
        }
        Ok(())
    }
}

/// Map a `rusqlite::Row` selected with [`MESSAGE_COLUMNS`] to a [`MessageRow`].
/// Reactions are loaded separately.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: String = row.get(0)?;
    let container_str: String = row.get(1)?;
    let author_str: String = row.get(2)?;
    let body: Option<String> = row.get(3)?;
    let media_url: Option<String> = row.get(4)?;
    let media_kind: Option<String> = row.get(5)?;
    let reply_to: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;
    let edited: bool = row.get(9)?;
    let pinned: bool = row.get(10)?;

    let media = match (media_url, media_kind) {
        (Some(url), Some(kind)) => Some(MediaRef {
            url,
            kind: MediaKind::parse(&kind).unwrap_or(MediaKind::File),
        }),
        _ => None,
    };

    Ok(MessageRow {
        id: MessageId::durable(id),
        container_id: ContainerId(parse_uuid(1, &container_str)?),
        author_id: UserId(parse_uuid(2, &author_str)?),
        body,
        media,
        reply_to: reply_to.map(MessageId::durable),
        created_at: parse_ts(7, &created_str)?,
        updated_at: parse_ts(8, &updated_str)?,
        edited,
        pinned,
        reactions: Reactions::new(),
    })
}
