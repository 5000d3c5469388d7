//! Mutable state owned by the sessions.
//!
//! [`ThreadState`] is the message list of one container together with the
//! optimistic tracker and fetch coordinator that act on it.
//! [`InboxState`] is the conversation list of one user. Both live behind a
//! `tokio::sync::Mutex` inside their session and are only ever mutated by
//! that session.

use std::collections::{BTreeSet, HashMap, HashSet};

use hearth_shared::{ContainerId, MessageId, UserId};
use hearth_store::{MessageRow, Profile};

use crate::config::SyncConfig;
use crate::containers::ContainerSummary;
use crate::events::{ChatView, InboxView};
use crate::fetch::{FetchCoordinator, FetchTicket};
use crate::model::{Message, ReplyPreview};
use crate::optimistic::OptimisticTracker;

/// The message list of one container.
#[derive(Debug)]
pub struct ThreadState {
    pub container_id: ContainerId,
    /// Oldest first. Optimistic entries sit after the confirmed rows that
    /// existed when they were created.
    pub messages: Vec<Message>,
    pub tracker: OptimisticTracker,
    pub fetch: FetchCoordinator,
    pub loading: bool,
    /// The last whole-list fetch failed; the list shown may be stale.
    pub load_failed: bool,
    /// Durable rows that appeared locally since the latest fetch started.
    pub arrived: HashSet<MessageId>,
    /// Durable rows removed locally since the latest fetch started.
    pub removed: HashSet<MessageId>,
    /// Authors the store had no profile for.
    pub missing_profiles: HashSet<UserId>,
}

impl ThreadState {
    pub fn new(container_id: ContainerId, config: &SyncConfig) -> Self {
        Self {
            container_id,
            messages: Vec::new(),
            tracker: OptimisticTracker::new(config.duplicate_window_chrono()),
            fetch: FetchCoordinator::new(config.fetch_debounce),
            loading: false,
            load_failed: false,
            arrived: HashSet::new(),
            removed: HashSet::new(),
            missing_profiles: HashSet::new(),
        }
    }

    /// Start a fetch. Arrivals and removals are tracked from here on, so the
    /// snapshot it returns cannot undo them.
    pub fn begin_fetch(&mut self, force: bool) -> Option<FetchTicket> {
        let ticket = self.fetch.begin(force)?;
        self.arrived.clear();
        self.removed.clear();
        Some(ticket)
    }

    pub fn note_arrival(&mut self, id: MessageId) {
        self.removed.remove(&id);
        self.arrived.insert(id);
    }

    pub fn note_removal(&mut self, id: MessageId) {
        self.arrived.remove(&id);
        self.removed.insert(id);
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Durable rows only, in list order, as kept in the message cache.
    pub fn confirmed_rows(&self) -> Vec<MessageRow> {
        self.messages
            .iter()
            .filter(|m| !m.is_optimistic())
            .map(Message::to_row)
            .collect()
    }

    /// Confirmed pinned messages, oldest first.
    pub fn pinned(&self) -> Vec<Message> {
        let mut pinned: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.pinned && !m.is_optimistic())
            .cloned()
            .collect();
        pinned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pinned
    }

    pub fn is_sending(&self) -> bool {
        self.tracker.sending_count() > 0
    }

    /// Authors whose profile has not been attached yet and was not already
    /// looked up in vain.
    pub fn unhydrated_authors(&self) -> Vec<UserId> {
        self.messages
            .iter()
            .filter(|m| m.author.is_none())
            .map(|m| m.author_id)
            .filter(|id| !self.missing_profiles.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Remember the ids of a completed lookup that came back without a
    /// profile.
    pub fn note_missing_profiles(&mut self, requested: &[UserId], found: &HashMap<UserId, Profile>) {
        self.missing_profiles
            .extend(requested.iter().filter(|id| !found.contains_key(id)));
    }

    pub fn attach_profiles(&mut self, profiles: &HashMap<UserId, Profile>) -> bool {
        let mut changed = false;
        for message in self.messages.iter_mut().filter(|m| m.author.is_none()) {
            if let Some(profile) = profiles.get(&message.author_id) {
                message.author = Some(profile.clone());
                changed = true;
            }
        }
        changed
    }

    /// Fill reply previews whose target is in the list. Returns the targets
    /// that still need a lookup.
    pub fn resolve_local_replies(&mut self) -> Vec<MessageId> {
        let previews: HashMap<MessageId, ReplyPreview> = self
            .messages
            .iter()
            .filter(|m| !m.is_optimistic())
            .map(|m| (m.id.clone(), ReplyPreview::of(m)))
            .collect();

        let mut missing = BTreeSet::new();
        for message in self.messages.iter_mut().filter(|m| m.reply_preview.is_none()) {
            let Some(target) = &message.reply_to else {
                continue;
            };
            match previews.get(target) {
                Some(preview) => message.reply_preview = Some(preview.clone()),
                None => {
                    missing.insert(target.clone());
                }
            }
        }
        missing.into_iter().collect()
    }

    pub fn attach_reply_rows(&mut self, rows: &[MessageRow]) -> bool {
        let previews: HashMap<&MessageId, ReplyPreview> =
            rows.iter().map(|r| (&r.id, ReplyPreview::of_row(r))).collect();
        let mut changed = false;
        for message in self.messages.iter_mut().filter(|m| m.reply_preview.is_none()) {
            if let Some(preview) = message.reply_to.as_ref().and_then(|t| previews.get(t)) {
                message.reply_preview = Some(preview.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn view(&self) -> ChatView {
        ChatView {
            container_id: self.container_id,
            messages: self.messages.clone(),
            pinned_messages: self.pinned(),
            loading: self.loading,
            sending: self.is_sending(),
            load_failed: self.load_failed,
        }
    }
}

/// The conversation list of one user.
#[derive(Debug)]
pub struct InboxState {
    pub summaries: Vec<ContainerSummary>,
    pub fetch: FetchCoordinator,
    pub loading: bool,
    pub load_failed: bool,
}

impl InboxState {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            summaries: Vec::new(),
            fetch: FetchCoordinator::new(config.fetch_debounce),
            loading: false,
            load_failed: false,
        }
    }

    pub fn view(&self) -> InboxView {
        InboxView {
            conversations: self.summaries.clone(),
            loading: self.loading,
            load_failed: self.load_failed,
        }
    }
}
