//! In-memory message model rendered by the UI.
//!
//! A [`Message`] wraps the durable row fields plus client-only state: the
//! delivery lifecycle of optimistic writes and hydrated author/reply data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hearth_shared::constants::REPLY_SNIPPET_CHARS;
use hearth_shared::{ContainerId, MessageId, UserId};
use hearth_store::{MediaRef, MessageRow, NewMessage, Profile, Reactions};

/// Delivery lifecycle of a message.
///
/// `Sending` and `Failed` only ever apply to entries carrying a temporary id;
/// `Confirmed` only to entries carrying a durable id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Delivery {
    Sending,
    Failed,
    Confirmed,
}

/// What a user submits: text, an attachment, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Content {
    pub body: Option<String>,
    pub media: Option<MediaRef>,
}

impl Content {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            media: None,
        }
    }

    pub fn media(media: MediaRef) -> Self {
        Self {
            body: None,
            media: Some(media),
        }
    }

    /// Trim the body and drop it when blank. `None` if nothing is left to send.
    pub fn normalized(self) -> Option<Self> {
        let body = self
            .body
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        if body.is_none() && self.media.is_none() {
            return None;
        }
        Some(Self {
            body,
            media: self.media,
        })
    }
}

/// Quoted excerpt of the message being replied to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: MessageId,
    pub author_id: UserId,
    pub snippet: String,
}

impl ReplyPreview {
    pub fn of(message: &Message) -> Self {
        Self::build(&message.id, message.author_id, message.body.as_deref(), message.media.is_some())
    }

    pub fn of_row(row: &MessageRow) -> Self {
        Self::build(&row.id, row.author_id, row.body.as_deref(), row.media.is_some())
    }

    fn build(id: &MessageId, author_id: UserId, body: Option<&str>, has_media: bool) -> Self {
        let snippet = match body {
            Some(body) => body.chars().take(REPLY_SNIPPET_CHARS).collect(),
            None if has_media => "[attachment]".to_string(),
            None => String::new(),
        };
        Self {
            id: id.clone(),
            author_id,
            snippet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub container_id: ContainerId,
    pub author_id: UserId,
    pub body: Option<String>,
    pub media: Option<MediaRef>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub edited: bool,
    pub pinned: bool,
    pub reactions: Reactions,
    pub delivery: Delivery,
    /// Author profile, filled in once it resolves.
    pub author: Option<Profile>,
    pub reply_preview: Option<ReplyPreview>,
}

impl Message {
    pub fn from_row(row: MessageRow) -> Self {
        Self {
            id: row.id,
            container_id: row.container_id,
            author_id: row.author_id,
            body: row.body,
            media: row.media,
            reply_to: row.reply_to,
            created_at: row.created_at,
            updated_at: row.updated_at,
            edited: row.edited,
            pinned: row.pinned,
            reactions: row.reactions,
            delivery: Delivery::Confirmed,
            author: None,
            reply_preview: None,
        }
    }

    /// Synthetic entry for a write the store has not accepted yet.
    pub fn optimistic(temp_id: MessageId, draft: &NewMessage) -> Self {
        Self {
            id: temp_id,
            container_id: draft.container_id,
            author_id: draft.author_id,
            body: draft.body.clone(),
            media: draft.media.clone(),
            reply_to: draft.reply_to.clone(),
            created_at: draft.created_at,
            updated_at: draft.created_at,
            edited: false,
            pinned: false,
            reactions: Reactions::new(),
            delivery: Delivery::Sending,
            author: None,
            reply_preview: None,
        }
    }

    /// Build the durable entry that replaces `self`, keeping hydrated data.
    pub fn confirmed_by(&self, row: MessageRow) -> Self {
        let mut confirmed = Self::from_row(row);
        confirmed.author = self.author.clone();
        if confirmed.reply_to == self.reply_to {
            confirmed.reply_preview = self.reply_preview.clone();
        }
        confirmed
    }

    /// Overwrite the durable fields with `row`, keeping hydrated data.
    pub fn absorb(&mut self, row: MessageRow) {
        if row.reply_to != self.reply_to {
            self.reply_preview = None;
        }
        self.body = row.body;
        self.media = row.media;
        self.reply_to = row.reply_to;
        self.created_at = row.created_at;
        self.updated_at = row.updated_at;
        self.edited = row.edited;
        self.pinned = row.pinned;
        self.reactions = row.reactions;
    }

    /// Durable fields only, as cached between sessions.
    pub fn to_row(&self) -> MessageRow {
        MessageRow {
            id: self.id.clone(),
            container_id: self.container_id,
            author_id: self.author_id,
            body: self.body.clone(),
            media: self.media.clone(),
            reply_to: self.reply_to.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            edited: self.edited,
            pinned: self.pinned,
            reactions: self.reactions.clone(),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.delivery != Delivery::Confirmed
    }

    pub fn is_sending(&self) -> bool {
        self.delivery == Delivery::Sending
    }

    pub fn is_failed(&self) -> bool {
        self.delivery == Delivery::Failed
    }
}

/// Add `user` to the `emoji` reactors, or remove them if already present.
/// Applying it twice restores the original set.
pub fn toggle_reaction(reactions: &mut Reactions, emoji: &str, user: UserId) {
    let reactors = reactions.entry(emoji.to_string()).or_default();
    if !reactors.remove(&user) {
        reactors.insert(user);
    }
    if reactors.is_empty() {
        reactions.remove(emoji);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_reaction_is_symmetric() {
        let me = UserId::new();
        let other = UserId::new();
        let mut reactions = Reactions::new();
        reactions.entry("🔥".to_string()).or_default().insert(other);
        let original = reactions.clone();

        toggle_reaction(&mut reactions, "🔥", me);
        assert_eq!(reactions["🔥"].len(), 2);
        toggle_reaction(&mut reactions, "🔥", me);
        assert_eq!(reactions, original);

        toggle_reaction(&mut reactions, "🎉", me);
        toggle_reaction(&mut reactions, "🎉", me);
        assert_eq!(reactions, original);
    }

    #[test]
    fn test_content_normalized() {
        assert_eq!(Content::text("   ").normalized(), None);
        assert_eq!(
            Content::text("  hi ").normalized(),
            Some(Content::text("hi"))
        );
        let media = MediaRef {
            url: "https://cdn.example/menu.png".into(),
            kind: hearth_store::MediaKind::Image,
        };
        let content = Content {
            body: Some(" ".into()),
            media: Some(media.clone()),
        };
        assert_eq!(content.normalized(), Some(Content::media(media)));
    }

    #[test]
    fn test_reply_preview_snippet() {
        let row = MessageRow {
            id: MessageId::from("m_1"),
            container_id: ContainerId::new(),
            author_id: UserId::new(),
            body: Some("x".repeat(200)),
            media: None,
            reply_to: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            edited: false,
            pinned: false,
            reactions: Reactions::new(),
        };
        assert_eq!(ReplyPreview::of_row(&row).snippet.chars().count(), REPLY_SNIPPET_CHARS);
    }
}
