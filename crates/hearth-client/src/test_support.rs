//! Scripted in-memory [`Backend`] for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use hearth_shared::{ContainerId, MessageId, UserId};
use hearth_store::{
    Backend, ChangeBus, ChangeEvent, ChangeFilter, Membership, MessagePatch, MessageQuery,
    MessageRow, NewMessage, Profile, Result, StoreError, Subscription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Select,
    SelectByIds,
    Insert,
    Update,
    Delete,
    Profiles,
    Memberships,
    LastMessages,
    MarkRead,
}

/// Where a gated insert blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePoint {
    /// Before the row exists anywhere.
    BeforeStore,
    /// After the row is stored and its event published, before the response.
    BeforeResponse,
}

pub struct MockBackend {
    me: UserId,
    rows: Mutex<Vec<MessageRow>>,
    profiles: Mutex<HashMap<UserId, Profile>>,
    memberships: Mutex<Vec<Membership>>,
    unread: Mutex<HashMap<ContainerId, u32>>,
    failing_unread: Mutex<HashSet<ContainerId>>,
    failing: Mutex<HashSet<Op>>,
    calls: Mutex<HashMap<Op, usize>>,
    next_id: AtomicU64,
    auto_publish: AtomicBool,
    gate: Mutex<Option<(GatePoint, Arc<Semaphore>)>>,
    select_gate: Mutex<Option<Arc<Semaphore>>>,
    unread_in_flight: AtomicUsize,
    unread_peak: AtomicUsize,
    bus: ChangeBus,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockBackend {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            rows: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            memberships: Mutex::new(Vec::new()),
            unread: Mutex::new(HashMap::new()),
            failing_unread: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            auto_publish: AtomicBool::new(true),
            gate: Mutex::new(None),
            select_gate: Mutex::new(None),
            unread_in_flight: AtomicUsize::new(0),
            unread_peak: AtomicUsize::new(0),
            bus: ChangeBus::new(64),
        }
    }

    pub fn seed(&self, row: MessageRow) {
        lock(&self.rows).push(row);
    }

    pub fn seed_profile(&self, profile: Profile) {
        lock(&self.profiles).insert(profile.id, profile);
    }

    pub fn seed_membership(&self, membership: Membership) {
        lock(&self.memberships).push(membership);
    }

    pub fn set_unread(&self, container: ContainerId, count: u32) {
        lock(&self.unread).insert(container, count);
    }

    pub fn fail_unread_for(&self, container: ContainerId) {
        lock(&self.failing_unread).insert(container);
    }

    pub fn set_next_id(&self, n: u64) {
        self.next_id.store(n, Ordering::SeqCst);
    }

    /// Stop publishing change events for writes; tests deliver them by hand.
    pub fn set_auto_publish(&self, on: bool) {
        self.auto_publish.store(on, Ordering::SeqCst);
    }

    pub fn fail(&self, op: Op) {
        lock(&self.failing).insert(op);
    }

    pub fn recover(&self, op: Op) {
        lock(&self.failing).remove(&op);
    }

    pub fn calls(&self, op: Op) -> usize {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Block every insert at `point` until a permit is added to the
    /// returned semaphore.
    pub fn gate_inserts(&self, point: GatePoint) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *lock(&self.gate) = Some((point, Arc::clone(&semaphore)));
        semaphore
    }

    /// Block every select after it has read its rows, until a permit is
    /// added to the returned semaphore.
    pub fn gate_selects(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *lock(&self.select_gate) = Some(Arc::clone(&semaphore));
        semaphore
    }

    /// Most unread lookups ever running at once.
    pub fn peak_unread_in_flight(&self) -> usize {
        self.unread_peak.load(Ordering::SeqCst)
    }

    pub fn row(&self, id: &str) -> Option<MessageRow> {
        lock(&self.rows).iter().find(|r| r.id.as_str() == id).cloned()
    }

    pub fn publish(&self, event: ChangeEvent) {
        self.bus.publish(event);
    }

    fn enter(&self, op: Op) -> Result<()> {
        *lock(&self.calls).entry(op).or_default() += 1;
        if lock(&self.failing).contains(&op) {
            return Err(StoreError::Rejected(format!("{op:?} failed")));
        }
        Ok(())
    }

    fn announce(&self, event: ChangeEvent) {
        if self.auto_publish.load(Ordering::SeqCst) {
            self.bus.publish(event);
        }
    }

    async fn wait_gate(&self, point: GatePoint) {
        let gate = lock(&self.gate).clone();
        let semaphore = match gate {
            Some((p, s)) if p == point => s,
            _ => return,
        };
        let permit = semaphore.acquire().await;
        if let Ok(permit) = permit {
            permit.forget();
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn select(&self, query: &MessageQuery) -> Result<Vec<MessageRow>> {
        self.enter(Op::Select)?;
        let mut rows: Vec<MessageRow> = lock(&self.rows)
            .iter()
            .filter(|r| r.container_id == query.container_id)
            .filter(|r| !query.pinned_only || r.pinned)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let skip = rows.len().saturating_sub(query.limit as usize);
        let page = rows.split_off(skip);

        let gate = lock(&self.select_gate).clone();
        if let Some(semaphore) = gate {
            let permit = semaphore.acquire().await;
            if let Ok(permit) = permit {
                permit.forget();
            }
        }
        Ok(page)
    }

    async fn select_by_ids(&self, ids: &[MessageId]) -> Result<Vec<MessageRow>> {
        self.enter(Op::SelectByIds)?;
        Ok(lock(&self.rows)
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn insert(&self, message: &NewMessage) -> Result<MessageRow> {
        self.enter(Op::Insert)?;
        self.wait_gate(GatePoint::BeforeStore).await;

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = MessageRow {
            id: MessageId(format!("m_{n}")),
            container_id: message.container_id,
            author_id: message.author_id,
            body: message.body.clone(),
            media: message.media.clone(),
            reply_to: message.reply_to.clone(),
            created_at: message.created_at,
            updated_at: message.created_at,
            edited: false,
            pinned: false,
            reactions: Default::default(),
        };
        lock(&self.rows).push(row.clone());
        self.announce(ChangeEvent::Insert(row.clone()));

        self.wait_gate(GatePoint::BeforeResponse).await;
        Ok(row)
    }

    async fn update(&self, id: &MessageId, patch: &MessagePatch) -> Result<MessageRow> {
        self.enter(Op::Update)?;
        let row = {
            let mut rows = lock(&self.rows);
            let row = rows.iter_mut().find(|r| &r.id == id).ok_or(StoreError::NotFound)?;
            if let Some(body) = &patch.body {
                row.body = Some(body.clone());
                row.edited = true;
            }
            if let Some(pinned) = patch.pinned {
                row.pinned = pinned;
            }
            if let Some(reactions) = &patch.reactions {
                row.reactions = reactions.clone();
            }
            row.updated_at = row.updated_at + chrono::Duration::milliseconds(1);
            row.clone()
        };
        self.announce(ChangeEvent::Update(row.clone()));
        Ok(row)
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        self.enter(Op::Delete)?;
        let removed = {
            let mut rows = lock(&self.rows);
            let index = rows.iter().position(|r| &r.id == id).ok_or(StoreError::NotFound)?;
            rows.remove(index)
        };
        self.announce(ChangeEvent::Delete {
            id: removed.id,
            container_id: removed.container_id,
        });
        Ok(())
    }

    async fn select_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>> {
        self.enter(Op::Profiles)?;
        let profiles = lock(&self.profiles);
        Ok(ids.iter().filter_map(|id| profiles.get(id).cloned()).collect())
    }

    async fn select_memberships(&self, user: UserId) -> Result<Vec<Membership>> {
        self.enter(Op::Memberships)?;
        Ok(lock(&self.memberships)
            .iter()
            .filter(|m| m.user_id == user)
            .cloned()
            .collect())
    }

    async fn select_last_messages(&self, containers: &[ContainerId]) -> Result<Vec<MessageRow>> {
        self.enter(Op::LastMessages)?;
        let rows = lock(&self.rows);
        Ok(containers
            .iter()
            .filter_map(|c| {
                rows.iter()
                    .filter(|r| r.container_id == *c)
                    .max_by_key(|r| r.created_at)
                    .cloned()
            })
            .collect())
    }

    async fn count_unread(
        &self,
        container: ContainerId,
        user: UserId,
        _since: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let running = self.unread_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.unread_peak.fetch_max(running, Ordering::SeqCst);
        let result = if lock(&self.failing_unread).contains(&container) {
            Err(StoreError::Rejected("unread lookup failed".into()))
        } else if user != self.me {
            // Scripted counts belong to the signed-in user.
            Ok(0)
        } else {
            Ok(lock(&self.unread).get(&container).copied().unwrap_or(0))
        };
        // The count is read up front and delivered late, like a slow query.
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.unread_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn mark_read(&self, container: ContainerId, user: UserId, at: DateTime<Utc>) -> Result<()> {
        self.enter(Op::MarkRead)?;
        let mut memberships = lock(&self.memberships);
        let membership = memberships
            .iter_mut()
            .find(|m| m.container.id == container && m.user_id == user)
            .ok_or(StoreError::NotFound)?;
        membership.last_read_at = Some(at);
        drop(memberships);
        lock(&self.unread).insert(container, 0);
        Ok(())
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription> {
        Ok(self.bus.subscribe(filter))
    }
}
