//! The conversation list of the signed-in user.
//!
//! [`ConversationList`] publishes the fast-path list as soon as memberships
//! and last messages are in, then patches unread counts as the background
//! workers report them. Message events on any container keep the last
//! message snapshots and ordering current between fetches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hearth_shared::{ContainerId, UserId};
use hearth_store::{
    Backend, ChangeEvent, ChangeFilter, ChangeNotification, Membership, MessageRow, Profile,
    Subscription,
};

use crate::cache::Caches;
use crate::config::SyncConfig;
use crate::containers::{
    apply_event_to_summaries, apply_mark_read, apply_unread, build_fast_path, enrich_unread,
    ContainerSummary, ListPatch, UnreadJob,
};
use crate::error::{Result, SyncError};
use crate::events::{publish, InboxView};
use crate::state::InboxState;

type FastPath = (Vec<Membership>, Vec<MessageRow>, HashMap<UserId, Profile>);

pub struct ConversationList {
    inner: Arc<InboxInner>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

struct InboxInner {
    backend: Arc<dyn Backend>,
    caches: Caches,
    config: SyncConfig,
    me: UserId,
    state: Mutex<InboxState>,
    view_tx: watch::Sender<InboxView>,
    /// Unread workers of the latest refresh, consumer first.
    enrichment: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConversationList {
    pub async fn open(
        backend: Arc<dyn Backend>,
        caches: Caches,
        config: SyncConfig,
        me: UserId,
    ) -> Result<Self> {
        let subscription = backend
            .subscribe(ChangeFilter::All)
            .await
            .map_err(SyncError::Subscribe)?;

        let (view_tx, _) = watch::channel(InboxView::default());
        let inner = Arc::new(InboxInner {
            state: Mutex::new(InboxState::new(&config)),
            backend,
            caches,
            config,
            me,
            view_tx,
            enrichment: StdMutex::new(Vec::new()),
        });

        inner.refresh(false).await;

        let pump = tokio::spawn(run_pump(Arc::clone(&inner), subscription));
        info!(user = %me, "Conversation list opened");

        Ok(Self {
            inner,
            pump: StdMutex::new(Some(pump)),
        })
    }

    /// Reload the list. Returns `false` only when a fetch was made and
    /// failed.
    pub async fn refresh(&self, force: bool) -> bool {
        self.inner.refresh(force).await
    }

    /// Zero the unread count locally and record the read marker. The count
    /// comes back if the store rejects the write.
    pub async fn mark_read(&self, container: ContainerId) -> bool {
        self.inner.mark_read(container).await
    }

    pub fn conversations(&self) -> Vec<ContainerSummary> {
        self.inner.view_tx.borrow().conversations.clone()
    }

    pub fn view(&self) -> InboxView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<InboxView> {
        self.inner.view_tx.subscribe()
    }

    /// Wait until the unread counts of the latest refresh are all in.
    pub async fn wait_for_unread(&self) {
        let handles = std::mem::take(
            &mut *self
                .inner
                .enrichment
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn close(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.inner.abort_enrichment();
        debug!(user = %self.inner.me, "Conversation list closed");
    }
}

impl Drop for ConversationList {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_pump(inner: Arc<InboxInner>, mut subscription: Subscription) {
    while let Some(notification) = subscription.next().await {
        match notification {
            ChangeNotification::Event(event) => inner.handle_event(&event).await,
            ChangeNotification::Lagged { skipped } => {
                warn!(skipped, "Conversation list missed change events, reloading");
                inner.refresh(true).await;
            }
        }
    }
}

impl InboxInner {
    fn publish_view(&self, state: &InboxState) {
        publish(&self.view_tx, state.view());
    }

    async fn sync_cache(&self, state: &InboxState) {
        self.caches
            .conversations
            .replace_value(&self.me, state.summaries.clone())
            .await;
    }

    fn abort_enrichment(&self) {
        let handles = std::mem::take(
            &mut *self.enrichment.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
    }

    async fn refresh(self: &Arc<Self>, force: bool) -> bool {
        if !force {
            let ttl = self.config.conversation_ttl;
            if let Some(list) = self.caches.conversations.get_fresh(&self.me, ttl).await {
                let mut state = self.state.lock().await;
                state.summaries = list;
                self.publish_view(&state);
                return true;
            }
        }

        let ticket = {
            let mut state = self.state.lock().await;
            let Some(ticket) = state.fetch.begin(force) else {
                return true;
            };
            state.loading = true;
            self.publish_view(&state);
            ticket
        };

        let fetched = self.fetch_fast_path().await;

        let mut state = self.state.lock().await;
        let current = state.fetch.complete(&ticket);
        state.loading = state.fetch.is_in_flight();

        let (memberships, last_messages, profiles) = match fetched {
            Ok(parts) => parts,
            Err(e) => {
                warn!(user = %self.me, error = %e, "Failed to load conversations");
                if current {
                    state.load_failed = true;
                }
                self.publish_view(&state);
                return false;
            }
        };
        if !current {
            debug!("Discarding superseded conversation fetch");
            self.publish_view(&state);
            return true;
        }

        let summaries = build_fast_path(memberships, &last_messages, &profiles, &state.summaries);
        state.summaries = summaries;
        state.load_failed = false;
        self.publish_view(&state);
        self.caches
            .conversations
            .set(self.me, state.summaries.clone())
            .await;
        info!(user = %self.me, count = state.summaries.len(), "Conversations loaded");

        let jobs: Vec<UnreadJob> = state.summaries.iter().map(UnreadJob::for_summary).collect();
        drop(state);
        self.start_enrichment(jobs);
        true
    }

    /// Memberships, one batched last-message lookup, and counterpart
    /// profiles.
    async fn fetch_fast_path(&self) -> hearth_store::Result<FastPath> {
        let memberships = self.backend.select_memberships(self.me).await?;
        let ids: Vec<ContainerId> = memberships.iter().map(|m| m.container.id).collect();
        let last_messages = self.backend.select_last_messages(&ids).await?;

        let counterparts: Vec<UserId> = memberships.iter().filter_map(|m| m.counterpart).collect();
        let profiles = self
            .caches
            .profiles_for(self.backend.as_ref(), &counterparts)
            .await;
        Ok((memberships, last_messages, profiles))
    }

    fn start_enrichment(self: &Arc<Self>, jobs: Vec<UnreadJob>) {
        self.abort_enrichment();
        if jobs.is_empty() {
            return;
        }

        let (mut rx, workers) = enrich_unread(
            Arc::clone(&self.backend),
            self.me,
            jobs,
            self.config.enrich_workers,
        );
        let inner = Arc::clone(self);
        let consumer = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let mut state = inner.state.lock().await;
                if apply_unread(&mut state.summaries, &result) {
                    inner.publish_view(&state);
                    inner.sync_cache(&state).await;
                }
            }
            debug!(user = %inner.me, "Unread counts refreshed");
        });

        let mut handles = self.enrichment.lock().unwrap_or_else(PoisonError::into_inner);
        handles.push(consumer);
        handles.extend(workers);
    }

    async fn handle_event(self: &Arc<Self>, event: &ChangeEvent) {
        let patch = {
            let mut state = self.state.lock().await;
            let patch = apply_event_to_summaries(&mut state.summaries, event, self.me);
            if patch == ListPatch::Patched {
                self.publish_view(&state);
                self.sync_cache(&state).await;
            }
            patch
        };

        if patch == ListPatch::NeedsRefetch {
            debug!(container = %event.container_id(), kind = event.kind(), "Conversation list needs reload");
            self.caches.conversations.invalidate(&self.me).await;
            self.refresh(false).await;
        }
    }

    async fn mark_read(&self, container: ContainerId) -> bool {
        let at = Utc::now();
        let previous = {
            let mut state = self.state.lock().await;
            let Some(previous) = apply_mark_read(&mut state.summaries, container, at) else {
                return false;
            };
            self.publish_view(&state);
            self.sync_cache(&state).await;
            previous
        };

        match self.backend.mark_read(container, self.me, at).await {
            Ok(()) => {
                debug!(container = %container, "Marked read");
                true
            }
            Err(e) => {
                warn!(container = %container, error = %e, "Mark read failed, restoring count");
                let mut state = self.state.lock().await;
                if let Some(summary) = state.summaries.iter_mut().find(|s| s.id == container) {
                    // Keep anything counted since the local reset.
                    summary.unread_count += previous.0;
                    summary.last_read_at = previous.1;
                }
                self.publish_view(&state);
                self.sync_cache(&state).await;
                false
            }
        }
    }
}
