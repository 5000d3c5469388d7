//! The chat session: the surface the application uses for one container.
//!
//! A session owns the container's [`ThreadState`] and the only change
//! subscription allowed to write to it. Every operation updates local state
//! first, publishes a new [`ChatView`], and only then talks to the store.
//! The state lock is never held across a store call; results are applied to
//! whatever the state is once they arrive.
//!
//! Store errors stop here. Writes report success as `bool`; a failed write
//! marks or reverts the local change and forces a refresh. A failed read
//! keeps the previous list and sets `load_failed` on the view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hearth_shared::{ContainerId, MessageId, UserId};
use hearth_store::{
    Backend, ChangeEvent, ChangeFilter, ChangeNotification, MessagePatch, MessageQuery, NewMessage,
    Subscription,
};

use crate::cache::Caches;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{publish, ChatView};
use crate::fetch::merge_fetched;
use crate::model::{toggle_reaction, Content, Message};
use crate::optimistic::Confirmation;
use crate::reconcile::{apply_event, Applied};
use crate::state::ThreadState;

pub struct ChatSession {
    inner: Arc<SessionInner>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

struct SessionInner {
    backend: Arc<dyn Backend>,
    caches: Caches,
    config: SyncConfig,
    me: UserId,
    container_id: ContainerId,
    state: Mutex<ThreadState>,
    view_tx: watch::Sender<ChatView>,
}

impl ChatSession {
    /// Subscribe to the container, load it, and start applying pushed
    /// changes.
    ///
    /// The subscription is taken before the initial fetch so no change made
    /// in between is lost. A failed initial fetch still yields a session,
    /// with `load_failed` set on its view.
    pub async fn open(
        backend: Arc<dyn Backend>,
        caches: Caches,
        config: SyncConfig,
        me: UserId,
        container_id: ContainerId,
    ) -> Result<Self> {
        let subscription = backend
            .subscribe(ChangeFilter::Container(container_id))
            .await
            .map_err(SyncError::Subscribe)?;

        let (view_tx, _) = watch::channel(ChatView::empty(container_id));
        let inner = Arc::new(SessionInner {
            state: Mutex::new(ThreadState::new(container_id, &config)),
            backend,
            caches,
            config,
            me,
            container_id,
            view_tx,
        });

        inner.refresh(false).await;

        let pump = tokio::spawn(run_pump(Arc::clone(&inner), subscription));
        info!(container = %container_id, "Chat session opened");

        Ok(Self {
            inner,
            pump: StdMutex::new(Some(pump)),
        })
    }

    pub fn container_id(&self) -> ContainerId {
        self.inner.container_id
    }

    /// Send a message. Returns `false` for an empty or duplicate send, or
    /// when the store rejects it (the entry then stays, marked failed).
    pub async fn send_message(&self, content: Content, reply_to: Option<MessageId>) -> bool {
        self.inner.send_message(content, reply_to).await
    }

    pub async fn edit_message(&self, id: &MessageId, body: &str) -> bool {
        self.inner.edit_message(id, body).await
    }

    /// Delete a message. A failed send that never reached the store is
    /// dropped locally.
    pub async fn delete_message(&self, id: &MessageId) -> bool {
        self.inner.delete_message(id).await
    }

    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str) {
        self.inner.toggle_reaction(id, emoji).await;
    }

    pub async fn toggle_pin(&self, id: &MessageId) -> bool {
        self.inner.toggle_pin(id).await
    }

    pub async fn retry_message(&self, id: &MessageId) {
        self.inner.retry_message(id).await;
    }

    /// Reload the container. Returns `false` only when a fetch was made and
    /// failed.
    pub async fn refresh(&self, force: bool) -> bool {
        self.inner.refresh(force).await
    }

    pub fn view(&self) -> ChatView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.view_tx.borrow().messages.clone()
    }

    pub fn pinned_messages(&self) -> Vec<Message> {
        self.inner.view_tx.borrow().pinned_messages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.view_tx.borrow().loading
    }

    pub fn is_sending(&self) -> bool {
        self.inner.view_tx.borrow().sending
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ChatView> {
        self.inner.view_tx.subscribe()
    }

    /// Stop applying pushed changes and drop the subscription.
    pub fn close(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
            info!(container = %self.inner.container_id, "Chat session closed");
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_pump(inner: Arc<SessionInner>, mut subscription: Subscription) {
    while let Some(notification) = subscription.next().await {
        match notification {
            ChangeNotification::Event(event) => inner.handle_event(event).await,
            ChangeNotification::Lagged { skipped } => {
                warn!(container = %inner.container_id, skipped, "Missed change events, reloading");
                inner.caches.messages.invalidate(&inner.container_id).await;
                inner.refresh(true).await;
            }
        }
    }
    debug!(container = %inner.container_id, "Change stream ended");
}

impl SessionInner {
    fn publish_view(&self, thread: &ThreadState) {
        publish(&self.view_tx, thread.view());
    }

    /// Keep the cached rows in step with the thread without restarting the
    /// cache entry's freshness window.
    async fn sync_cache(&self, thread: &ThreadState) {
        self.caches
            .messages
            .replace_value(&self.container_id, thread.confirmed_rows())
            .await;
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    async fn refresh(&self, force: bool) -> bool {
        if !force {
            let ttl = self.config.message_ttl;
            if let Some(rows) = self.caches.messages.get_fresh(&self.container_id, ttl).await {
                let mut thread = self.state.lock().await;
                merge_fetched(&mut thread, rows);
                self.publish_view(&thread);
                drop(thread);
                self.hydrate().await;
                return true;
            }
        }

        let ticket = {
            let mut thread = self.state.lock().await;
            let Some(ticket) = thread.begin_fetch(force) else {
                return true;
            };
            thread.loading = true;
            self.publish_view(&thread);
            ticket
        };

        let query = MessageQuery::latest(self.container_id, self.config.page_size);
        let result = self.backend.select(&query).await;

        let mut thread = self.state.lock().await;
        let current = thread.fetch.complete(&ticket);
        thread.loading = thread.fetch.is_in_flight();

        let ok = match result {
            Ok(rows) if current => {
                let report = merge_fetched(&mut thread, rows);
                self.caches
                    .messages
                    .set(self.container_id, thread.confirmed_rows())
                    .await;
                thread.load_failed = false;
                debug!(
                    container = %self.container_id,
                    count = thread.messages.len(),
                    confirmed = report.confirmed,
                    pending = report.pending,
                    carried = report.carried,
                    "Messages fetched"
                );
                true
            }
            Ok(_) => {
                debug!(container = %self.container_id, "Discarding superseded fetch");
                true
            }
            Err(e) => {
                warn!(container = %self.container_id, error = %e, "Failed to fetch messages");
                if current {
                    thread.load_failed = true;
                }
                false
            }
        };
        self.publish_view(&thread);
        drop(thread);

        if ok {
            self.hydrate().await;
        }
        ok
    }

    /// Attach author profiles and reply previews. Best effort: failures are
    /// logged and the entries stay as they are.
    async fn hydrate(&self) {
        let (authors, replies) = {
            let mut thread = self.state.lock().await;
            let replies = thread.resolve_local_replies();
            (thread.unhydrated_authors(), replies)
        };
        if authors.is_empty() && replies.is_empty() {
            return;
        }

        let profiles = if authors.is_empty() {
            Ok(HashMap::new())
        } else {
            self.caches
                .lookup_profiles(self.backend.as_ref(), &authors)
                .await
        };

        let reply_rows = if replies.is_empty() {
            Vec::new()
        } else {
            match self.backend.select_by_ids(&replies).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(count = replies.len(), error = %e, "Failed to load reply targets");
                    Vec::new()
                }
            }
        };

        let mut thread = self.state.lock().await;
        let profiles = match profiles {
            Ok(profiles) => {
                thread.note_missing_profiles(&authors, &profiles);
                profiles
            }
            Err(e) => {
                warn!(count = authors.len(), error = %e, "Failed to load author profiles");
                HashMap::new()
            }
        };
        let changed = thread.attach_profiles(&profiles) | thread.attach_reply_rows(&reply_rows);
        if changed {
            self.publish_view(&thread);
        }
    }

    // ------------------------------------------------------------------
    // Push events
    // ------------------------------------------------------------------

    async fn handle_event(self: &Arc<Self>, event: ChangeEvent) {
        let kind = event.kind();
        let id = event.message_id().clone();

        let applied = {
            let mut thread = self.state.lock().await;
            let applied = apply_event(&mut thread, event, self.me);
            if applied.changed() {
                self.sync_cache(&thread).await;
                self.publish_view(&thread);
            }
            applied
        };
        debug!(container = %self.container_id, kind, msg_id = %id, ?applied, "Change event applied");

        if matches!(applied, Applied::Inserted { .. } | Applied::Updated) {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.hydrate().await });
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    async fn send_message(&self, content: Content, reply_to: Option<MessageId>) -> bool {
        let Some(content) = content.normalized() else {
            debug!(container = %self.container_id, "Ignoring empty message");
            return false;
        };
        let draft = NewMessage {
            container_id: self.container_id,
            author_id: self.me,
            body: content.body,
            media: content.media,
            reply_to,
            created_at: Utc::now(),
        };

        let own_profile = self.caches.profiles.get(&self.me).await;
        let temp_id = {
            let mut guard = self.state.lock().await;
            let thread = &mut *guard;
            let Some(temp_id) = thread.tracker.begin(&mut thread.messages, draft.clone()) else {
                return false;
            };
            if let Some(entry) = thread.get_mut(&temp_id) {
                entry.author = own_profile;
            }
            thread.resolve_local_replies();
            self.publish_view(thread);
            temp_id
        };

        let sent = self.submit(temp_id, draft).await;
        self.hydrate().await;
        sent
    }

    async fn retry_message(&self, id: &MessageId) {
        let retried = {
            let mut guard = self.state.lock().await;
            let thread = &mut *guard;
            let retried = thread.tracker.retry(&mut thread.messages, id, Utc::now());
            if retried.is_some() {
                self.publish_view(thread);
            }
            retried
        };

        match retried {
            Some((temp_id, draft)) => {
                info!(container = %self.container_id, old = %id, new = %temp_id, "Retrying message");
                self.submit(temp_id, draft).await;
            }
            None => debug!(msg_id = %id, "Nothing to retry"),
        }
    }

    async fn submit(&self, temp_id: MessageId, draft: NewMessage) -> bool {
        match self.backend.insert(&draft).await {
            Ok(row) => {
                let durable_id = row.id.clone();
                let mut guard = self.state.lock().await;
                let thread = &mut *guard;
                let outcome = thread.tracker.confirm(&mut thread.messages, &temp_id, row);
                if outcome != Confirmation::AlreadyResolved {
                    thread.note_arrival(durable_id.clone());
                    self.sync_cache(thread).await;
                }
                self.publish_view(thread);
                info!(
                    container = %self.container_id,
                    temp_id = %temp_id,
                    msg_id = %durable_id,
                    ?outcome,
                    "Message sent"
                );
                true
            }
            Err(e) => {
                warn!(container = %self.container_id, temp_id = %temp_id, error = %e, "Send failed");
                {
                    let mut guard = self.state.lock().await;
                    let thread = &mut *guard;
                    thread.tracker.fail(&mut thread.messages, &temp_id);
                    self.publish_view(thread);
                }
                self.refresh(true).await;
                false
            }
        }
    }

    async fn edit_message(&self, id: &MessageId, body: &str) -> bool {
        let body = body.trim();
        if body.is_empty() {
            return false;
        }

        let previous = {
            let mut thread = self.state.lock().await;
            let Some(entry) = thread.get_mut(id).filter(|m| !m.is_optimistic()) else {
                debug!(msg_id = %id, "Edit of unknown or unconfirmed message");
                return false;
            };
            if entry.body.as_deref() == Some(body) {
                return true;
            }
            let previous = (entry.body.clone(), entry.edited);
            entry.body = Some(body.to_string());
            entry.edited = true;
            self.publish_view(&thread);
            previous
        };

        let patch = MessagePatch {
            body: Some(body.to_string()),
            ..MessagePatch::default()
        };
        let result = self
            .write_patch(id, &patch, |entry| {
                entry.body = previous.0.clone();
                entry.edited = previous.1;
            })
            .await;
        if result {
            info!(container = %self.container_id, msg_id = %id, "Message edited");
        }
        result
    }

    async fn toggle_reaction(&self, id: &MessageId, emoji: &str) {
        let reactions = {
            let mut thread = self.state.lock().await;
            let Some(entry) = thread.get_mut(id).filter(|m| !m.is_optimistic()) else {
                return;
            };
            toggle_reaction(&mut entry.reactions, emoji, self.me);
            let reactions = entry.reactions.clone();
            self.publish_view(&thread);
            reactions
        };

        let me = self.me;
        let patch = MessagePatch {
            reactions: Some(reactions),
            ..MessagePatch::default()
        };
        self.write_patch(id, &patch, |entry| toggle_reaction(&mut entry.reactions, emoji, me))
            .await;
    }

    async fn toggle_pin(&self, id: &MessageId) -> bool {
        let pinned = {
            let mut thread = self.state.lock().await;
            let Some(entry) = thread.get_mut(id).filter(|m| !m.is_optimistic()) else {
                return false;
            };
            entry.pinned = !entry.pinned;
            let pinned = entry.pinned;
            self.publish_view(&thread);
            pinned
        };

        let patch = MessagePatch {
            pinned: Some(pinned),
            ..MessagePatch::default()
        };
        self.write_patch(id, &patch, |entry| entry.pinned = !pinned).await
    }

    /// Send an update whose effect is already applied locally. On failure
    /// `revert` undoes it and a refresh is forced.
    async fn write_patch<F>(&self, id: &MessageId, patch: &MessagePatch, revert: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        match self.backend.update(id, patch).await {
            Ok(row) => {
                let mut thread = self.state.lock().await;
                if let Some(entry) = thread.get_mut(id) {
                    if row.updated_at >= entry.updated_at {
                        entry.absorb(row);
                    }
                }
                self.sync_cache(&thread).await;
                self.publish_view(&thread);
                true
            }
            Err(e) => {
                warn!(container = %self.container_id, msg_id = %id, error = %e, "Update failed, reverting");
                {
                    let mut thread = self.state.lock().await;
                    if let Some(entry) = thread.get_mut(id) {
                        revert(entry);
                    }
                    self.publish_view(&thread);
                }
                self.refresh(true).await;
                false
            }
        }
    }

    async fn delete_message(&self, id: &MessageId) -> bool {
        let removed = {
            let mut guard = self.state.lock().await;
            let thread = &mut *guard;

            if thread.tracker.is_unresolved(id) {
                // Only a failed send can be dropped; a sending one may still land.
                let failed = thread.get(id).is_some_and(Message::is_failed);
                let dropped = failed && thread.tracker.discard(&mut thread.messages, id);
                if dropped {
                    self.publish_view(thread);
                }
                return dropped;
            }

            let Some(index) = thread.position(id) else {
                return false;
            };
            let entry = thread.messages.remove(index);
            thread.note_removal(id.clone());
            let before = index
                .checked_sub(1)
                .map(|i| thread.messages[i].id.clone());
            self.publish_view(thread);
            (index, before, entry)
        };

        match self.backend.delete(id).await {
            Ok(()) => {
                let thread = self.state.lock().await;
                self.sync_cache(&thread).await;
                info!(container = %self.container_id, msg_id = %id, "Message deleted");
                true
            }
            Err(e) => {
                warn!(container = %self.container_id, msg_id = %id, error = %e, "Delete failed, restoring");
                {
                    let mut thread = self.state.lock().await;
                    let (index, before, entry) = removed;
                    thread.removed.remove(id);
                    if thread.position(id).is_none() {
                        let at = match before {
                            Some(before) => thread.position(&before).map_or(index, |i| i + 1),
                            None => 0,
                        };
                        let at = at.min(thread.messages.len());
                        thread.messages.insert(at, entry);
                    }
                    self.publish_view(&thread);
                }
                self.refresh(true).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone};

    use hearth_store::{MessageRow, Profile, Reactions};

    use super::*;
    use crate::model::Delivery;
    use crate::test_support::{GatePoint, MockBackend, Op};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(container: ContainerId, id: &str, author: UserId, secs: i64) -> MessageRow {
        MessageRow {
            id: MessageId::from(id),
            container_id: container,
            author_id: author,
            body: Some(id.to_string()),
            media: None,
            reply_to: None,
            created_at: at(secs),
            updated_at: at(secs),
            edited: false,
            pinned: false,
            reactions: Reactions::new(),
        }
    }

    fn ids(view: &ChatView) -> Vec<String> {
        view.messages.iter().map(|m| m.id.to_string()).collect()
    }

    /// Run every ready task until the runtime is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    struct Harness {
        mock: Arc<MockBackend>,
        caches: Caches,
        me: UserId,
        other: UserId,
        container: ContainerId,
    }

    impl Harness {
        fn new() -> Self {
            let me = UserId::new();
            Self {
                mock: Arc::new(MockBackend::new(me)),
                caches: Caches::new(),
                me,
                other: UserId::new(),
                container: ContainerId::new(),
            }
        }

        fn seed(&self, id: &str, author: UserId, secs: i64) {
            self.mock.seed(row(self.container, id, author, secs));
        }

        async fn open(&self) -> ChatSession {
            self.open_with(SyncConfig::default()).await
        }

        async fn open_with(&self, config: SyncConfig) -> ChatSession {
            ChatSession::open(
                self.mock.clone(),
                self.caches.clone(),
                config,
                self.me,
                self.container,
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_send_confirms_in_place_when_response_comes_first() {
        let h = Harness::new();
        h.mock.set_next_id(42);
        let session = Arc::new(h.open().await);
        let gate = h.mock.gate_inserts(GatePoint::BeforeStore);

        let sender = Arc::clone(&session);
        let send = tokio::spawn(async move { sender.send_message(Content::text("hello"), None).await });
        settle().await;

        let view = session.view();
        assert_eq!(view.messages.len(), 1);
        assert!(view.messages[0].id.is_temporary());
        assert!(view.sending);

        gate.add_permits(1);
        assert!(send.await.unwrap());
        settle().await;

        let view = session.view();
        assert_eq!(ids(&view), vec!["m_42"]);
        assert_eq!(view.messages[0].delivery, Delivery::Confirmed);
        assert!(!view.sending);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_send_confirms_once_when_event_comes_first() {
        let h = Harness::new();
        h.mock.set_next_id(42);
        let session = Arc::new(h.open().await);
        let gate = h.mock.gate_inserts(GatePoint::BeforeResponse);

        let sender = Arc::clone(&session);
        let send = tokio::spawn(async move { sender.send_message(Content::text("hello"), None).await });
        settle().await;

        // The pushed insert has already replaced the optimistic entry.
        let view = session.view();
        assert_eq!(ids(&view), vec!["m_42"]);
        assert!(!view.sending);

        gate.add_permits(1);
        assert!(send.await.unwrap());
        settle().await;
        assert_eq!(ids(&session.view()), vec!["m_42"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_redelivered_insert_is_ignored() {
        let h = Harness::new();
        h.mock.set_next_id(42);
        h.mock.set_auto_publish(false);
        let session = h.open().await;

        assert!(session.send_message(Content::text("hello"), None).await);
        let row = h.mock.row("m_42").unwrap();
        h.mock.publish(ChangeEvent::Insert(row.clone()));
        h.mock.publish(ChangeEvent::Insert(row));
        settle().await;

        assert_eq!(ids(&session.view()), vec!["m_42"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_send_stays_and_can_be_retried() {
        let h = Harness::new();
        h.mock.fail(Op::Insert);
        let session = h.open().await;
        assert_eq!(h.mock.calls(Op::Select), 1);

        assert!(!session.send_message(Content::text("hello"), None).await);
        let view = session.view();
        assert_eq!(view.messages.len(), 1);
        assert!(view.messages[0].is_failed());
        assert!(!view.sending);
        // A failed write forces a resync.
        assert_eq!(h.mock.calls(Op::Select), 2);

        h.mock.recover(Op::Insert);
        let failed = view.messages[0].id.clone();
        session.retry_message(&failed).await;
        settle().await;

        let view = session.view();
        assert_eq!(view.messages.len(), 1);
        assert!(!view.messages[0].id.is_temporary());
        assert_eq!(view.messages[0].delivery, Delivery::Confirmed);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_forced_refresh_keeps_pending_send() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        h.seed("m_2", h.other, 20);
        h.mock.set_next_id(3);
        let session = Arc::new(h.open().await);
        let gate = h.mock.gate_inserts(GatePoint::BeforeStore);

        let sender = Arc::clone(&session);
        let send = tokio::spawn(async move { sender.send_message(Content::text("on my way"), None).await });
        settle().await;
        let temp = session.messages()[2].id.clone();

        assert!(session.refresh(true).await);
        let view = session.view();
        assert_eq!(ids(&view), vec!["m_1".to_string(), "m_2".to_string(), temp.to_string()]);
        assert!(view.messages[2].is_sending());

        gate.add_permits(1);
        assert!(send.await.unwrap());
        settle().await;
        assert_eq!(ids(&session.view()), vec!["m_1", "m_2", "m_3"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_delete_restores_original_position() {
        let h = Harness::new();
        for i in 1..=9 {
            h.seed(&format!("m_{i}"), h.other, i * 10);
        }
        let session = h.open().await;
        let original = ids(&session.view());

        h.mock.fail(Op::Delete);
        assert!(!session.delete_message(&MessageId::from("m_5")).await);
        assert_eq!(ids(&session.view()), original);

        h.mock.recover(Op::Delete);
        assert!(session.delete_message(&MessageId::from("m_5")).await);
        settle().await;
        let remaining = ids(&session.view());
        assert_eq!(remaining.len(), 8);
        assert!(!remaining.contains(&"m_5".to_string()));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_send_can_be_deleted_locally() {
        let h = Harness::new();
        h.mock.fail(Op::Insert);
        let session = h.open().await;
        session.send_message(Content::text("typo"), None).await;
        let failed = session.messages()[0].id.clone();

        assert!(session.delete_message(&failed).await);
        assert!(session.messages().is_empty());
        assert_eq!(h.mock.calls(Op::Delete), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_reaction_toggle_twice_restores_original() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        let session = h.open().await;
        let id = MessageId::from("m_1");

        session.toggle_reaction(&id, "👍").await;
        assert!(session.messages()[0].reactions["👍"].contains(&h.me));
        assert!(h.mock.row("m_1").unwrap().reactions["👍"].contains(&h.me));

        session.toggle_reaction(&id, "👍").await;
        settle().await;
        assert!(session.messages()[0].reactions.is_empty());
        assert!(h.mock.row("m_1").unwrap().reactions.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_reaction_is_reverted() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        let session = h.open().await;
        h.mock.fail(Op::Update);

        session.toggle_reaction(&MessageId::from("m_1"), "🔥").await;
        assert!(session.messages()[0].reactions.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_edit_applies_or_reverts() {
        let h = Harness::new();
        h.seed("m_1", h.me, 10);
        let session = h.open().await;
        let id = MessageId::from("m_1");

        h.mock.fail(Op::Update);
        assert!(!session.edit_message(&id, "changed").await);
        let messages = session.messages();
        let entry = &messages[0];
        assert_eq!(entry.body.as_deref(), Some("m_1"));
        assert!(!entry.edited);

        h.mock.recover(Op::Update);
        assert!(session.edit_message(&id, "changed").await);
        let messages = session.messages();
        let entry = &messages[0];
        assert_eq!(entry.body.as_deref(), Some("changed"));
        assert!(entry.edited);
        assert_eq!(h.mock.row("m_1").unwrap().body.as_deref(), Some("changed"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_toggle_pin_updates_pinned_collection() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        h.seed("m_2", h.other, 20);
        let session = h.open().await;

        assert!(session.toggle_pin(&MessageId::from("m_2")).await);
        let pinned = session.pinned_messages();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].id.as_str(), "m_2");

        assert!(session.toggle_pin(&MessageId::from("m_2")).await);
        assert!(session.pinned_messages().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_refresh_respects_message_ttl() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);

        let session = h.open().await;
        assert_eq!(h.mock.calls(Op::Select), 1);

        assert!(session.refresh(false).await);
        assert_eq!(h.mock.calls(Op::Select), 1);

        // A second view of the same container is served from the cache.
        let second = h.open().await;
        assert_eq!(h.mock.calls(Op::Select), 1);
        assert_eq!(ids(&second.view()), vec!["m_1"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.refresh(false).await);
        assert_eq!(h.mock.calls(Op::Select), 2);

        assert!(session.refresh(true).await);
        assert_eq!(h.mock.calls(Op::Select), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_incoming_message_is_hydrated_with_author() {
        let h = Harness::new();
        h.mock.seed_profile(Profile {
            id: h.other,
            display_name: Some("Rosa".into()),
            username: Some("rosa".into()),
            avatar_url: None,
        });
        let session = h.open().await;

        h.mock
            .insert(&NewMessage {
                container_id: h.container,
                author_id: h.other,
                body: Some("table 4 is ready".into()),
                media: None,
                reply_to: None,
                created_at: at(100),
            })
            .await
            .unwrap();
        settle().await;

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        let author = messages[0].author.as_ref().unwrap();
        assert_eq!(author.display_name.as_deref(), Some("Rosa"));
        assert!(h.caches.profiles.get(&h.other).await.is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_reply_preview_resolves_outside_loaded_page() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        h.seed("m_2", h.other, 20);
        h.seed("m_3", h.other, 30);
        h.mock.set_next_id(10);
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };
        let session = h.open_with(config).await;
        assert_eq!(ids(&session.view()), vec!["m_2", "m_3"]);

        let reply_to = Some(MessageId::from("m_1"));
        assert!(session.send_message(Content::text("same here"), reply_to).await);

        let messages = session.messages();
        let preview = messages[2].reply_preview.as_ref().unwrap();
        assert_eq!(preview.id.as_str(), "m_1");
        assert_eq!(preview.snippet, "m_1");
        assert_eq!(h.mock.calls(Op::SelectByIds), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_load_sets_flag_and_recovers() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        h.mock.fail(Op::Select);

        let session = h.open().await;
        let view = session.view();
        assert!(view.load_failed);
        assert!(view.messages.is_empty());
        assert!(!view.loading);

        h.mock.recover(Op::Select);
        assert!(session.refresh(true).await);
        let view = session.view();
        assert!(!view.load_failed);
        assert_eq!(ids(&view), vec!["m_1"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_empty_send_is_rejected_locally() {
        let h = Harness::new();
        let session = h.open().await;

        assert!(!session.send_message(Content::text("   "), None).await);
        assert!(session.messages().is_empty());
        assert_eq!(h.mock.calls(Op::Insert), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_closed_session_ignores_events() {
        let h = Harness::new();
        let session = h.open().await;
        session.close();

        h.mock
            .insert(&NewMessage {
                container_id: h.container,
                author_id: h.other,
                body: Some("anyone there?".into()),
                media: None,
                reply_to: None,
                created_at: at(100),
            })
            .await
            .unwrap();
        settle().await;

        assert!(session.messages().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_push_during_fetch_survives_older_page() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        h.seed("m_2", h.other, 20);
        let session = Arc::new(h.open().await);

        let gate = h.mock.gate_selects();
        let refresher = Arc::clone(&session);
        let refresh = tokio::spawn(async move { refresher.refresh(true).await });
        settle().await;

        // Both changes land after the page was read.
        h.mock.set_next_id(9);
        h.mock
            .insert(&NewMessage {
                container_id: h.container,
                author_id: h.other,
                body: Some("table 9 is up".into()),
                media: None,
                reply_to: None,
                created_at: at(50),
            })
            .await
            .unwrap();
        h.mock.delete(&MessageId::from("m_2")).await.unwrap();
        settle().await;
        assert_eq!(ids(&session.view()), vec!["m_1", "m_9"]);

        gate.add_permits(1);
        assert!(refresh.await.unwrap());
        assert_eq!(ids(&session.view()), vec!["m_1", "m_9"]);

        // The cached page reflects the merge, not the stale snapshot.
        let second = h.open().await;
        assert_eq!(ids(&second.view()), vec!["m_1", "m_9"]);
        assert_eq!(h.mock.calls(Op::Select), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_lagged_subscription_forces_reload() {
        let h = Harness::new();
        h.seed("m_1", h.other, 10);
        let session = h.open().await;
        assert_eq!(h.mock.calls(Op::Select), 1);

        // Overflow the change buffer before the pump gets to run.
        for i in 0..100 {
            let mut row = row(h.container, &format!("x_{i}"), h.other, 10);
            row.updated_at = at(20);
            h.mock.publish(ChangeEvent::Update(row));
        }
        h.seed("m_2", h.other, 30);
        settle().await;

        assert_eq!(h.mock.calls(Op::Select), 2);
        assert_eq!(ids(&session.view()), vec!["m_1", "m_2"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_author_without_profile_is_looked_up_once() {
        let h = Harness::new();
        let session = h.open().await;

        for secs in [100, 110, 120] {
            h.mock
                .insert(&NewMessage {
                    container_id: h.container,
                    author_id: h.other,
                    body: Some(format!("ping {secs}")),
                    media: None,
                    reply_to: None,
                    created_at: at(secs),
                })
                .await
                .unwrap();
            settle().await;
        }

        assert_eq!(session.messages().len(), 3);
        assert_eq!(h.mock.calls(Op::Profiles), 1);
    }
}
