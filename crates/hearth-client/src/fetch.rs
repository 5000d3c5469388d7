//! Fetch coordination.
//!
//! [`FetchCoordinator`] decides whether a fetch may start and whether its
//! response may still be applied. [`merge_fetched`] folds a fetched page
//! into the current thread without losing writes that are still pending.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use hearth_shared::MessageId;
use hearth_store::MessageRow;

use crate::model::Message;
use crate::state::ThreadState;

/// Handed out when a fetch starts and checked when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    token: u64,
    pub force: bool,
}

#[derive(Debug)]
pub struct FetchCoordinator {
    debounce: Duration,
    in_flight: Option<u64>,
    last_started: Option<Instant>,
    latest: u64,
}

impl FetchCoordinator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            in_flight: None,
            last_started: None,
            latest: 0,
        }
    }

    /// Start a fetch. A non-forced fetch is skipped while another one is in
    /// flight or when the previous one started within the debounce window.
    pub fn begin(&mut self, force: bool) -> Option<FetchTicket> {
        let now = Instant::now();
        if !force {
            if self.in_flight.is_some() {
                debug!("Fetch already in flight, skipping");
                return None;
            }
            if let Some(last) = self.last_started {
                if now.duration_since(last) < self.debounce {
                    debug!("Fetch debounced");
                    return None;
                }
            }
        }

        self.latest += 1;
        self.in_flight = Some(self.latest);
        self.last_started = Some(now);
        Some(FetchTicket {
            token: self.latest,
            force,
        })
    }

    /// Finish the fetch for `ticket`. Returns `true` if its response is the
    /// newest one issued and may be applied.
    pub fn complete(&mut self, ticket: &FetchTicket) -> bool {
        if self.in_flight == Some(ticket.token) {
            self.in_flight = None;
        }
        ticket.token == self.latest
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// What [`merge_fetched`] did with the local entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Pending writes whose durable rows were in the page.
    pub confirmed: usize,
    /// Pending writes kept at the tail.
    pub pending: usize,
    /// Rows that arrived after the fetch started and were missing from it.
    pub carried: usize,
}

/// Replace the thread with `rows`, keeping hydrated data of entries that
/// survive and re-appending unconfirmed optimistic entries at the tail.
///
/// The page may predate changes already applied locally. A local entry
/// newer than its fetched row is kept as is, rows that arrived since the
/// fetch started are kept even when the page lacks them, and rows removed
/// since then are not brought back.
pub fn merge_fetched(thread: &mut ThreadState, rows: Vec<MessageRow>) -> MergeReport {
    let mut report = MergeReport::default();
    let old = std::mem::take(&mut thread.messages);

    let mut optimistic = Vec::new();
    let mut known: HashMap<MessageId, Message> = HashMap::with_capacity(old.len());
    for message in old {
        if message.is_optimistic() {
            optimistic.push(message);
        } else {
            known.insert(message.id.clone(), message);
        }
    }

    let mut merged = Vec::with_capacity(rows.len() + optimistic.len());
    for row in rows {
        if thread.removed.contains(&row.id) {
            continue;
        }
        if let Some(mut existing) = known.remove(&row.id) {
            if row.updated_at >= existing.updated_at {
                existing.absorb(row);
            }
            merged.push(existing);
            continue;
        }

        match thread.tracker.match_row(&row) {
            Some(temp_id) => {
                let index = optimistic.iter().position(|m| m.id == temp_id);
                let entry = match index {
                    Some(i) => optimistic.remove(i).confirmed_by(row.clone()),
                    None => Message::from_row(row.clone()),
                };
                thread.tracker.mark_confirmed(&temp_id, row.id);
                report.confirmed += 1;
                merged.push(entry);
            }
            None => merged.push(Message::from_row(row)),
        }
    }

    let mut carried: Vec<Message> = known
        .into_values()
        .filter(|m| thread.arrived.contains(&m.id))
        .collect();
    if !carried.is_empty() {
        report.carried = carried.len();
        carried.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        merged.extend(carried);
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!(count = report.carried, "Kept rows newer than the fetched page");
    }

    for entry in optimistic {
        if thread.tracker.is_unresolved(&entry.id) {
            report.pending += 1;
            merged.push(entry);
        }
    }

    thread.messages = merged;
    report
}
