//! Conversation list building.
//!
//! The list is produced in two passes. The fast path joins memberships with
//! one batched last-message lookup and is published immediately. The slow
//! path computes unread counts per container on a small pool of workers
//! pulling from a shared queue, and each result patches the list as it
//! arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hearth_shared::{ContainerId, MessageId, UserId};
use hearth_store::{
    Backend, ChangeEvent, ContainerKind, MediaKind, Membership, MessageRow, Profile,
};

/// Denormalized snapshot of a container's newest message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub id: MessageId,
    pub body: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl LastMessage {
    pub fn of_row(row: &MessageRow) -> Self {
        Self {
            id: row.id.clone(),
            body: row.body.clone(),
            media_kind: row.media.as_ref().map(|m| m.kind),
            sender_id: row.author_id,
            created_at: row.created_at,
        }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub kind: ContainerKind,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
    /// The other participant of a direct conversation.
    pub counterpart: Option<Profile>,
    pub last_message: Option<LastMessage>,
    pub last_activity: DateTime<Utc>,
    /// Advisory; refined in the background after the list is first shown.
    pub unread_count: u32,
    pub muted: bool,
    pub archived: bool,
    pub pinned: bool,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl ContainerSummary {
    pub fn display_title(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        match &self.counterpart {
            Some(profile) => profile.label(),
            None => "Conversation".to_string(),
        }
    }

    fn set_last_message(&mut self, row: &MessageRow) {
        self.last_message = Some(LastMessage::of_row(row));
        if row.created_at > self.last_activity {
            self.last_activity = row.created_at;
        }
    }
}

/// Pinned first, then most recent activity, then container id.
pub fn sort_summaries(list: &mut [ContainerSummary]) {
    list.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.last_activity.cmp(&a.last_activity))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Build the list from memberships and last messages.
///
/// Unread counts are carried over from `previous` so a refresh never shows
/// zero while the slow path is still running.
pub fn build_fast_path(
    memberships: Vec<Membership>,
    last_messages: &[MessageRow],
    profiles: &HashMap<UserId, Profile>,
    previous: &[ContainerSummary],
) -> Vec<ContainerSummary> {
    let last_by_container: HashMap<ContainerId, &MessageRow> = last_messages
        .iter()
        .map(|row| (row.container_id, row))
        .collect();
    let previous_unread: HashMap<ContainerId, u32> =
        previous.iter().map(|s| (s.id, s.unread_count)).collect();

    let mut list: Vec<ContainerSummary> = memberships
        .into_iter()
        .map(|m| {
            let last = last_by_container.get(&m.container.id).copied();
            let mut summary = ContainerSummary {
                id: m.container.id,
                kind: m.container.kind,
                title: m.container.title,
                avatar_url: m.container.avatar_url,
                counterpart: m.counterpart.and_then(|id| profiles.get(&id).cloned()),
                last_message: None,
                last_activity: m.container.created_at,
                unread_count: previous_unread.get(&m.container.id).copied().unwrap_or(0),
                muted: m.muted,
                archived: m.archived,
                pinned: m.pinned,
                last_read_at: m.last_read_at,
            };
            if let Some(row) = last {
                summary.set_last_message(row);
            }
            summary
        })
        .collect();

    sort_summaries(&mut list);
    list
}

/// Set one container's unread count. Returns `false` if it is not listed,
/// or if its read marker moved since the count was requested.
pub fn apply_unread(list: &mut [ContainerSummary], result: &UnreadCount) -> bool {
    match list.iter_mut().find(|s| s.id == result.container) {
        Some(summary) if summary.last_read_at == result.since => {
            summary.unread_count = result.count;
            true
        }
        Some(_) => {
            debug!(container = %result.container, "Dropping unread count from before mark read");
            false
        }
        None => false,
    }
}

/// Outcome of folding a change event into the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPatch {
    Unchanged,
    Patched,
    /// The event cannot be applied locally; the list should be refetched.
    NeedsRefetch,
}

pub fn apply_event_to_summaries(
    list: &mut Vec<ContainerSummary>,
    event: &ChangeEvent,
    me: UserId,
) -> ListPatch {
    let Some(summary) = list.iter_mut().find(|s| s.id == event.container_id()) else {
        // A conversation this list has not seen yet.
        return match event {
            ChangeEvent::Insert(_) => ListPatch::NeedsRefetch,
            _ => ListPatch::Unchanged,
        };
    };

    match event {
        ChangeEvent::Insert(row) => {
            let newer = summary
                .last_message
                .as_ref()
                .map_or(true, |last| row.created_at >= last.created_at && last.id != row.id);
            if !newer {
                return ListPatch::Unchanged;
            }
            summary.set_last_message(row);
            let unseen = summary.last_read_at.map_or(true, |read| row.created_at > read);
            if row.author_id != me && unseen {
                summary.unread_count += 1;
            }
            sort_summaries(list);
            ListPatch::Patched
        }
        ChangeEvent::Update(row) => match &summary.last_message {
            Some(last) if last.id == row.id => {
                summary.set_last_message(row);
                ListPatch::Patched
            }
            _ => ListPatch::Unchanged,
        },
        ChangeEvent::Delete { id, .. } => match &summary.last_message {
            Some(last) if &last.id == id => ListPatch::NeedsRefetch,
            _ => ListPatch::Unchanged,
        },
    }
}

/// Mark everything up to `at` read locally. Returns the previous unread
/// count and read marker so the change can be reverted.
pub fn apply_mark_read(
    list: &mut [ContainerSummary],
    container: ContainerId,
    at: DateTime<Utc>,
) -> Option<(u32, Option<DateTime<Utc>>)> {
    let summary = list.iter_mut().find(|s| s.id == container)?;
    let previous = (summary.unread_count, summary.last_read_at);
    summary.unread_count = 0;
    summary.last_read_at = Some(at);
    Some(previous)
}

// ---------------------------------------------------------------------------
// Slow path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadJob {
    pub container: ContainerId,
    pub since: Option<DateTime<Utc>>,
}

impl UnreadJob {
    pub fn for_summary(summary: &ContainerSummary) -> Self {
        Self {
            container: summary.id,
            since: summary.last_read_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadCount {
    pub container: ContainerId,
    /// The read marker the count was computed against.
    pub since: Option<DateTime<Utc>>,
    pub count: u32,
}

/// Compute unread counts with at most `workers` lookups in flight.
///
/// Results stream out of the returned receiver as they complete; the
/// channel closes once the queue is drained. A failed lookup is logged and
/// produces no result, so that container keeps its last known count.
pub fn enrich_unread(
    backend: Arc<dyn Backend>,
    me: UserId,
    jobs: Vec<UnreadJob>,
    workers: usize,
) -> (mpsc::UnboundedReceiver<UnreadCount>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let workers = workers.max(1).min(jobs.len().max(1));
    let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));

    let handles = (0..workers)
        .map(|worker| {
            let backend = Arc::clone(&backend);
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let Some(job) = queue.lock().await.pop_front() else {
                        break;
                    };
                    match backend.count_unread(job.container, me, job.since).await {
                        Ok(count) => {
                            let result = UnreadCount {
                                container: job.container,
                                since: job.since,
                                count,
                            };
                            if tx.send(result).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(container = %job.container, error = %e, "Unread count failed");
                        }
                    }
                }
                debug!(worker, "Unread worker finished");
            })
        })
        .collect();

    (rx, handles)
}
