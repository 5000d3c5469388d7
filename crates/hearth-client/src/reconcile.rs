//! Folding pushed change events into a thread.
//!
//! [`apply_event`] is a plain reducer over [`ThreadState`]: no I/O, no
//! timers. The session's event pump only forwards subscription events into
//! it and reacts to the returned [`Applied`] value.

use tracing::debug;

use hearth_shared::{MessageId, UserId};
use hearth_store::{ChangeEvent, MessageRow};

use crate::model::Message;
use crate::optimistic::Confirmation;
use crate::state::ThreadState;

/// Why an event left the thread untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// The event belongs to another container.
    Foreign,
    /// The row is already listed (redelivery).
    Duplicate,
    /// The row is not listed; the next fetch will carry it.
    Unknown,
    /// The row is older than the listed entry.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A new row was inserted at `index`.
    Inserted { index: usize, author_id: UserId },
    /// The row confirmed one of our own pending writes.
    Confirmed { temp_id: MessageId },
    Updated,
    Removed { index: usize },
    Skipped(Skip),
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

pub fn apply_event(thread: &mut ThreadState, event: ChangeEvent, me: UserId) -> Applied {
    if event.container_id() != thread.container_id {
        return Applied::Skipped(Skip::Foreign);
    }

    let applied = match event {
        ChangeEvent::Insert(row) => apply_insert(thread, row, me),
        ChangeEvent::Update(row) => apply_update(thread, row),
        ChangeEvent::Delete { id, .. } => match thread.position(&id) {
            Some(index) => {
                thread.messages.remove(index);
                thread.note_removal(id);
                Applied::Removed { index }
            }
            None => Applied::Skipped(Skip::Unknown),
        },
    };

    if let Applied::Skipped(reason) = &applied {
        debug!(container = %thread.container_id, ?reason, "Change event skipped");
    }
    applied
}

fn apply_insert(thread: &mut ThreadState, row: MessageRow, me: UserId) -> Applied {
    if thread.position(&row.id).is_some() {
        return Applied::Skipped(Skip::Duplicate);
    }

    if row.author_id == me {
        if let Some(temp_id) = thread.tracker.match_row(&row) {
            let id = row.id.clone();
            return match thread.tracker.confirm(&mut thread.messages, &temp_id, row) {
                Confirmation::AlreadyResolved => Applied::Skipped(Skip::Duplicate),
                _ => {
                    thread.note_arrival(id);
                    Applied::Confirmed { temp_id }
                }
            };
        }
    }

    // Pending writes stay as the tail block; the row goes into the confirmed
    // run before them, in creation order.
    let mut index = thread.messages.len();
    while index > 0 && thread.messages[index - 1].is_optimistic() {
        index -= 1;
    }
    while index > 0 {
        let previous = &thread.messages[index - 1];
        if previous.is_optimistic() || previous.created_at <= row.created_at {
            break;
        }
        index -= 1;
    }

    let author_id = row.author_id;
    thread.note_arrival(row.id.clone());
    thread.messages.insert(index, Message::from_row(row));
    Applied::Inserted { index, author_id }
}

fn apply_update(thread: &mut ThreadState, row: MessageRow) -> Applied {
    let Some(existing) = thread.get_mut(&row.id) else {
        return Applied::Skipped(Skip::Unknown);
    };
    if row.updated_at < existing.updated_at {
        return Applied::Skipped(Skip::Stale);
    }
    existing.absorb(row);
    Applied::Updated
}
