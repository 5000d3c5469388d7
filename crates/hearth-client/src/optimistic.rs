//! Optimistic write tracking.
//!
//! Every send is a small state machine:
//!
//! ```text
//! begin ──► Sending ──► Confirmed(durable id)
//!              │  ▲
//!              ▼  │ retry
//!            Failed
//! ```
//!
//! The tracker owns that state per temporary id and performs the matching
//! list edits: `begin` appends the synthetic entry at the tail, `confirm`
//! swaps it for the durable row in place, `fail` flags it. Confirmation is
//! idempotent: whichever of the direct response and the pushed insert event
//! lands second finds the write already resolved and does nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use hearth_shared::MessageId;
use hearth_store::{MessageRow, NewMessage};

use crate::model::{Delivery, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    Sending,
    Failed,
    Confirmed(MessageId),
}

#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub temp_id: MessageId,
    pub draft: NewMessage,
    pub state: WriteState,
    pub attempts: u32,
}

impl PendingWrite {
    fn is_unresolved(&self) -> bool {
        !matches!(self.state, WriteState::Confirmed(_))
    }
}

/// Result of [`OptimisticTracker::confirm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The synthetic entry at `index` now holds the durable row.
    Replaced { index: usize },
    /// The durable row was already listed; the synthetic entry was dropped.
    Merged { index: usize },
    /// Nothing to do: unknown temp id or already confirmed.
    AlreadyResolved,
}

#[derive(Debug)]
pub struct OptimisticTracker {
    writes: HashMap<MessageId, PendingWrite>,
    seq: u64,
    duplicate_window: chrono::Duration,
}

impl OptimisticTracker {
    pub fn new(duplicate_window: chrono::Duration) -> Self {
        Self {
            writes: HashMap::new(),
            seq: 0,
            duplicate_window,
        }
    }

    /// Append a synthetic entry for `draft` and return its temporary id.
    ///
    /// Returns `None` when an identical send from the same author is still
    /// in flight within the duplicate window.
    pub fn begin(&mut self, list: &mut Vec<Message>, draft: NewMessage) -> Option<MessageId> {
        if let Some(existing) = self.in_flight_duplicate(&draft) {
            debug!(temp_id = %existing, "identical send already in flight, skipping");
            return None;
        }

        let temp_id = MessageId::temporary(draft.created_at.timestamp_millis(), self.seq);
        self.seq += 1;

        list.push(Message::optimistic(temp_id.clone(), &draft));
        self.writes.insert(
            temp_id.clone(),
            PendingWrite {
                temp_id: temp_id.clone(),
                draft,
                state: WriteState::Sending,
                attempts: 1,
            },
        );
        Some(temp_id)
    }

    /// Replace the synthetic entry for `temp_id` with the durable `row`.
    pub fn confirm(&mut self, list: &mut Vec<Message>, temp_id: &MessageId, row: MessageRow) -> Confirmation {
        let Some(write) = self.writes.get_mut(temp_id) else {
            return Confirmation::AlreadyResolved;
        };
        if !write.is_unresolved() {
            return Confirmation::AlreadyResolved;
        }
        write.state = WriteState::Confirmed(row.id.clone());

        let temp_pos = list.iter().position(|m| &m.id == temp_id);
        let durable_pos = list.iter().position(|m| m.id == row.id);

        match (temp_pos, durable_pos) {
            (Some(t), None) => {
                list[t] = list[t].confirmed_by(row);
                Confirmation::Replaced { index: t }
            }
            (Some(t), Some(d)) => {
                list.remove(t);
                let index = if d > t { d - 1 } else { d };
                if row.updated_at >= list[index].updated_at {
                    list[index].absorb(row);
                }
                Confirmation::Merged { index }
            }
            // The entry was discarded locally or already swapped; never
            // resurrect it.
            (None, _) => Confirmation::AlreadyResolved,
        }
    }

    /// Record that `temp_id` was confirmed as `durable_id` when the caller
    /// has already put the durable entry in place.
    pub fn mark_confirmed(&mut self, temp_id: &MessageId, durable_id: MessageId) -> bool {
        match self.writes.get_mut(temp_id) {
            Some(write) if write.is_unresolved() => {
                write.state = WriteState::Confirmed(durable_id);
                true
            }
            _ => false,
        }
    }

    /// Flag a sending entry as failed, keeping it in the list.
    pub fn fail(&mut self, list: &mut [Message], temp_id: &MessageId) -> bool {
        let Some(write) = self.writes.get_mut(temp_id) else {
            return false;
        };
        if write.state != WriteState::Sending {
            return false;
        }
        write.state = WriteState::Failed;
        if let Some(entry) = list.iter_mut().find(|m| &m.id == temp_id) {
            entry.delivery = Delivery::Failed;
        }
        true
    }

    /// Resubmit a failed write: its entry is removed and the same content is
    /// sent again through [`begin`](Self::begin) with a fresh temp id.
    pub fn retry(
        &mut self,
        list: &mut Vec<Message>,
        temp_id: &MessageId,
        now: DateTime<Utc>,
    ) -> Option<(MessageId, NewMessage)> {
        let write = self.writes.get(temp_id)?;
        if write.state != WriteState::Failed {
            return None;
        }

        let mut draft = write.draft.clone();
        draft.created_at = now;
        if self.in_flight_duplicate(&draft).is_some() {
            return None;
        }

        let attempts = write.attempts;
        let previous = list.iter().position(|m| &m.id == temp_id).map(|i| list.remove(i));
        self.writes.remove(temp_id);

        let new_id = self.begin(list, draft.clone())?;
        if let Some(write) = self.writes.get_mut(&new_id) {
            write.attempts = attempts + 1;
        }
        if let (Some(previous), Some(entry)) = (previous, list.last_mut()) {
            entry.author = previous.author;
            entry.reply_preview = previous.reply_preview;
        }
        Some((new_id, draft))
    }

    /// Drop an unconfirmed write and its entry without contacting the store.
    pub fn discard(&mut self, list: &mut Vec<Message>, temp_id: &MessageId) -> bool {
        match self.writes.get(temp_id) {
            Some(write) if write.is_unresolved() => {
                self.writes.remove(temp_id);
                list.retain(|m| &m.id != temp_id);
                true
            }
            _ => false,
        }
    }

    /// Find the unresolved write a durable row most likely confirms: same
    /// author, container, body and attachment, created within the duplicate
    /// window. The oldest candidate wins.
    pub fn match_row(&self, row: &MessageRow) -> Option<MessageId> {
        self.writes
            .values()
            .filter(|w| w.is_unresolved())
            .filter(|w| {
                w.draft.author_id == row.author_id
                    && w.draft.container_id == row.container_id
                    && w.draft.body == row.body
                    && w.draft.media == row.media
                    && (w.draft.created_at - row.created_at).abs() <= self.duplicate_window
            })
            .min_by_key(|w| w.draft.created_at)
            .map(|w| w.temp_id.clone())
    }

    pub fn state(&self, temp_id: &MessageId) -> Option<&WriteState> {
        self.writes.get(temp_id).map(|w| &w.state)
    }

    pub fn write(&self, temp_id: &MessageId) -> Option<&PendingWrite> {
        self.writes.get(temp_id)
    }

    /// Durable id a temporary id was confirmed as.
    pub fn resolve(&self, temp_id: &MessageId) -> Option<&MessageId> {
        match self.writes.get(temp_id).map(|w| &w.state) {
            Some(WriteState::Confirmed(id)) => Some(id),
            _ => None,
        }
    }

    pub fn is_unresolved(&self, temp_id: &MessageId) -> bool {
        self.writes.get(temp_id).is_some_and(PendingWrite::is_unresolved)
    }

    /// Number of writes still waiting for the store.
    pub fn sending_count(&self) -> usize {
        self.writes
            .values()
            .filter(|w| w.state == WriteState::Sending)
            .count()
    }

    fn in_flight_duplicate(&self, draft: &NewMessage) -> Option<&MessageId> {
        self.writes
            .values()
            .filter(|w| w.state == WriteState::Sending)
            .find(|w| {
                w.draft.author_id == draft.author_id
                    && w.draft.container_id == draft.container_id
                    && w.draft.body == draft.body
                    && w.draft.media == draft.media
                    && (w.draft.created_at - draft.created_at).abs() <= self.duplicate_window
            })
            .map(|w| &w.temp_id)
    }
}
