//! The backing-store contract.
//!
//! The client core talks to the store only through [`Backend`]: plain
//! request/response calls plus a push subscription of [`ChangeEvent`]s.
//! Delivery on the push side is at-least-once and unordered relative to the
//! direct responses, so an insert event may arrive before or after the
//! response to the write that caused it.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use hearth_shared::constants::CHANGE_BUS_CAPACITY;
use hearth_shared::{ContainerId, MessageId, UserId};

use crate::error::Result;
use crate::models::{Membership, MessagePatch, MessageQuery, MessageRow, NewMessage, Profile};

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// A row-level change pushed by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "eventType", content = "row", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert(MessageRow),
    Update(MessageRow),
    Delete {
        id: MessageId,
        container_id: ContainerId,
    },
}

impl ChangeEvent {
    pub fn container_id(&self) -> ContainerId {
        match self {
            Self::Insert(row) | Self::Update(row) => row.container_id,
            Self::Delete { container_id, .. } => *container_id,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Insert(row) | Self::Update(row) => &row.id,
            Self::Delete { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    All,
    Container(ContainerId),
    Containers(HashSet<ContainerId>),
}

impl ChangeFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::All => true,
            Self::Container(id) => event.container_id() == *id,
            Self::Containers(ids) => ids.contains(&event.container_id()),
        }
    }
}

/// What a subscriber sees on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    Event(ChangeEvent),
    /// The subscriber fell behind and `skipped` events were lost.
    Lagged { skipped: u64 },
}

/// Fan-out of change events to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        debug!(kind = event.kind(), id = %event.message_id(), "publishing change event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(CHANGE_BUS_CAPACITY)
    }
}

/// A live change-event subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
}

impl Subscription {
    /// Wait for the next matching notification. `None` once the store has
    /// shut the stream down.
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => {
                    return Some(ChangeNotification::Event(event))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscription lagged");
                    return Some(ChangeNotification::Lagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    pub fn unsubscribe(self) {}
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Everything the synchronization core requires from a store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Rows of one container, oldest first.
    async fn select(&self, query: &MessageQuery) -> Result<Vec<MessageRow>>;

    /// Batch lookup of messages by id (reply previews). Unknown ids are skipped.
    async fn select_by_ids(&self, ids: &[MessageId]) -> Result<Vec<MessageRow>>;

    /// Insert a message and return the durable row.
    async fn insert(&self, message: &NewMessage) -> Result<MessageRow>;

    /// Apply a patch and return the updated row.
    async fn update(&self, id: &MessageId, patch: &MessagePatch) -> Result<MessageRow>;

    async fn delete(&self, id: &MessageId) -> Result<()>;

    /// Batch lookup of profiles. Unknown ids are skipped.
    async fn select_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>>;

    /// Every container `user` belongs to.
    async fn select_memberships(&self, user: UserId) -> Result<Vec<Membership>>;

    /// Newest message of each container, at most one row per container.
    async fn select_last_messages(&self, containers: &[ContainerId]) -> Result<Vec<MessageRow>>;

    /// Messages from other authors newer than `since` (all of them if `None`).
    async fn count_unread(
        &self,
        container: ContainerId,
        user: UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<u32>;

    async fn mark_read(&self, container: ContainerId, user: UserId, at: DateTime<Utc>)
        -> Result<()>;

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn row(container_id: ContainerId, id: &str) -> MessageRow {
        let now = Utc::now();
        MessageRow {
            id: MessageId::from(id),
            container_id,
            author_id: UserId::new(),
            body: Some("hi".into()),
            media: None,
            reply_to: None,
            created_at: now,
            updated_at: now,
            edited: false,
            pinned: false,
            reactions: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_subscription_filters_by_container() {
        let bus = ChangeBus::new(16);
        let wanted = ContainerId::new();
        let other = ContainerId::new();
        let mut sub = bus.subscribe(ChangeFilter::Container(wanted));

        bus.publish(ChangeEvent::Insert(row(other, "m_1")));
        bus.publish(ChangeEvent::Insert(row(wanted, "m_2")));

        match sub.next().await {
            Some(ChangeNotification::Event(event)) => {
                assert_eq!(event.message_id().as_str(), "m_2");
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_reports_lag() {
        let bus = ChangeBus::new(2);
        let container = ContainerId::new();
        let mut sub = bus.subscribe(ChangeFilter::All);

        for i in 0..5 {
            bus.publish(ChangeEvent::Insert(row(container, &format!("m_{i}"))));
        }

        assert!(matches!(
            sub.next().await,
            Some(ChangeNotification::Lagged { skipped: 3 })
        ));
    }

    #[test]
    fn test_unsubscribe_drops_receiver() {
        let bus = ChangeBus::new(4);
        let sub = bus.subscribe(ChangeFilter::All);
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
