//! Row models exchanged with the backing store.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a UI layer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hearth_shared::{ContainerId, MessageId, UserId};

/// Reactions on a message: emoji -> set of reactor ids.
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Public identity of a user, as cached by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: UserId,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Best label for the user: display name, then username, then a short id.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.id.short())
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Reference to an uploaded attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A durable message row as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    pub id: MessageId,
    pub container_id: ContainerId,
    pub author_id: UserId,
    pub body: Option<String>,
    pub media: Option<MediaRef>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    /// Bumped by the store on every update; used to drop stale events.
    pub updated_at: DateTime<Utc>,
    pub edited: bool,
    pub pinned: bool,
    pub reactions: Reactions,
}

/// Payload of an insert request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub container_id: ContainerId,
    pub author_id: UserId,
    pub body: Option<String>,
    pub media: Option<MediaRef>,
    pub reply_to: Option<MessageId>,
    /// Client send time; the store keeps it as the row's creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields changed by an update request. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePatch {
    /// New body; the store also sets `edited`.
    pub body: Option<String>,
    pub pinned: Option<bool>,
    /// Replaces the whole reaction set.
    pub reactions: Option<Reactions>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.pinned.is_none() && self.reactions.is_none()
    }
}

/// Parameters of a message-list query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub container_id: ContainerId,
    /// Only return pinned rows.
    pub pinned_only: bool,
    /// The newest `limit` rows are selected, returned oldest first.
    pub limit: u32,
}

impl MessageQuery {
    pub fn latest(container_id: ContainerId, limit: u32) -> Self {
        Self {
            container_id,
            pinned_only: false,
            limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// One-to-one conversation.
    Direct,
    /// Group channel.
    Channel,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// A conversation or channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub id: ContainerId,
    pub kind: ContainerKind,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user's membership in a container, with the per-user flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub container: Container,
    pub user_id: UserId,
    pub muted: bool,
    pub archived: bool,
    pub pinned: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    /// The other participant of a direct conversation.
    pub counterpart: Option<UserId>,
}
