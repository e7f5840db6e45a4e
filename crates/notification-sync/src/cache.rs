//! Local notification cache.
//!
//! The cache owns the ordered notification list, the unread counter and the
//! bookkeeping for unconfirmed optimistic reads. All mutators take the single
//! state lock, apply their change and release it without awaiting, so the
//! poller and user-triggered mutations can never interleave mid-update.
//!
//! Every session-scoped mutator carries the epoch it was started under. Ending
//! a session bumps the epoch, which turns late completions into no-ops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::counter::UnreadCounter;
use crate::model::{Notification, NotificationId};

/// Lifecycle of a single notification as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not observed locally.
    Unknown,
    Unread,
    /// Marked read locally, remote confirmation outstanding.
    ReadPendingConfirm,
    Read,
}

/// Why the cache was replaced from a remote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// Snapshot contained ids not seen before.
    NewArrivals,
    /// Snapshot size changed without new ids (deletions).
    SizeChanged,
    /// Local unread state disagreed with the authoritative count.
    Drift,
    /// Explicit fetch or post-mutation refresh.
    Refresh,
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NewArrivals => "new_arrivals",
            Self::SizeChanged => "size_changed",
            Self::Drift => "drift",
            Self::Refresh => "refresh",
        };
        f.write_str(s)
    }
}

/// Result of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Replaced(ResyncReason),
    Unchanged,
}

/// What the poller learned from diffing ids before taking the cache lock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReconcileHint {
    pub has_new_ids: bool,
    pub size_changed: bool,
}

/// Outcome of completing a pending optimistic change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The change was settled against current state.
    Applied,
    /// A resync or later mark took over; nothing to undo.
    Superseded,
    /// The owning session has ended.
    Discarded,
}

/// Outcome of rolling back a bulk mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BulkRollback {
    Restored,
    /// The cache was resynced since the bulk mark started; the saved snapshot
    /// is older than what we hold now.
    Stale,
    Discarded,
}

/// Handle for a single optimistic read awaiting remote confirmation.
#[derive(Debug, Clone)]
pub(crate) struct ReadTicket {
    pub epoch: u64,
    pub ticket: u64,
    pub prior: Notification,
}

impl ReadTicket {
    pub fn id(&self) -> &NotificationId {
        &self.prior.id
    }
}

/// Handle for an optimistic mark-all awaiting remote confirmation.
#[derive(Debug, Clone)]
pub(crate) struct BulkTicket {
    pub epoch: u64,
    generation: u64,
    prior_entries: Vec<Notification>,
    prior_counter: UnreadCounter,
    tickets: Vec<(NotificationId, u64)>,
}

impl BulkTicket {
    pub fn marked(&self) -> usize {
        self.tickets.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingMark {
    ticket: u64,
    since: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: Vec<Notification>,
    index: HashMap<NotificationId, usize>,
    counter: UnreadCounter,
    pending: HashMap<NotificationId, PendingMark>,
    bulk_in_flight: bool,
    epoch: u64,
    /// Bumped on every wholesale replace.
    generation: u64,
    next_ticket: u64,
}

impl CacheState {
    fn position(&self, id: &NotificationId) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn derived_unread(&self) -> u64 {
        self.entries.iter().filter(|n| !n.is_read).count() as u64
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn holds_back(&self, id: &NotificationId, grace: Duration, now: Instant) -> bool {
        self.pending
            .get(id)
            .is_some_and(|p| now.saturating_duration_since(p.since) < grace)
    }

    /// Count snapshot entries whose remote unread state would be overridden
    /// by a pending local read.
    fn held_back_in(&self, snapshot: &[Notification], grace: Duration, now: Instant) -> u64 {
        let mut seen = HashSet::new();
        snapshot
            .iter()
            .filter(|n| seen.insert(&n.id))
            .filter(|n| !n.is_read && self.holds_back(&n.id, grace, now))
            .count() as u64
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
    }

    /// Replace all entries with `snapshot`.
    ///
    /// Pending reads inside the grace window keep their local read state and
    /// their tickets; every other ticket is dropped. The counter becomes the
    /// authoritative count minus the held-back entries, or the derived count
    /// when no authoritative value is given.
    fn replace(
        &mut self,
        snapshot: Vec<Notification>,
        authoritative: Option<u64>,
        grace: Duration,
        now: Instant,
    ) {
        let mut entries = Vec::with_capacity(snapshot.len());
        let mut index = HashMap::with_capacity(snapshot.len());
        let mut kept = HashSet::new();

        for mut n in snapshot {
            if index.contains_key(&n.id) {
                continue;
            }
            if !n.is_read && self.holds_back(&n.id, grace, now) {
                n.is_read = true;
                kept.insert(n.id.clone());
            }
            index.insert(n.id.clone(), entries.len());
            entries.push(n);
        }

        self.pending.retain(|id, _| kept.contains(id));
        self.entries = entries;
        self.index = index;
        self.generation += 1;

        let unread = match authoritative {
            Some(count) => count.saturating_sub(kept.len() as u64),
            None => self.derived_unread(),
        };
        self.counter.set(unread);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.pending.clear();
        self.counter.reset();
        self.bulk_in_flight = false;
        self.generation += 1;
    }
}

/// Ordered, id-unique notification cache with an unread counter.
#[derive(Debug, Default)]
pub struct NotificationCache {
    state: Mutex<CacheState>,
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache from a verified snapshot, keeping its order.
    ///
    /// The counter is derived from the snapshot. Unconfirmed reads are
    /// dropped.
    pub fn replace_all(&self, snapshot: Vec<Notification>) {
        self.state
            .lock()
            .replace(snapshot, None, Duration::ZERO, Instant::now());
    }

    /// Set the read flag of a known entry, adjusting the counter.
    ///
    /// Unknown ids are ignored. Returns whether anything changed.
    pub fn set_read(&self, id: &NotificationId, value: bool) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.position(id) else {
            return false;
        };
        if state.entries[pos].is_read == value {
            return false;
        }

        state.entries[pos].is_read = value;
        if value {
            state.counter.decrement();
        } else {
            state.counter.increment();
        }
        true
    }

    pub fn get(&self, id: &NotificationId) -> Option<Notification> {
        let state = self.state.lock();
        state.position(id).map(|pos| state.entries[pos].clone())
    }

    pub fn unread_count(&self) -> u64 {
        self.state.lock().counter.get()
    }

    /// Count of cached entries that are unread, independent of the counter.
    pub fn derived_unread(&self) -> u64 {
        self.state.lock().derived_unread()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, id: &NotificationId) -> EntityState {
        let state = self.state.lock();
        match state.position(id) {
            None => EntityState::Unknown,
            Some(pos) if !state.entries[pos].is_read => EntityState::Unread,
            Some(_) if state.pending.contains_key(id) => EntityState::ReadPendingConfirm,
            Some(_) => EntityState::Read,
        }
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Start a fresh session scope, discarding everything cached.
    pub(crate) fn begin_session(&self) -> u64 {
        let mut state = self.state.lock();
        state.clear();
        state.epoch += 1;
        state.epoch
    }

    /// End the current session scope. Late completions become no-ops.
    pub(crate) fn end_session(&self) {
        let mut state = self.state.lock();
        state.clear();
        state.epoch += 1;
    }

    /// Replace from a remote snapshot with the authoritative count.
    ///
    /// Returns `false` when the session has moved on.
    pub(crate) fn resync(
        &self,
        epoch: u64,
        snapshot: Vec<Notification>,
        authoritative: u64,
        grace: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        state.replace(snapshot, Some(authoritative), grace, Instant::now());
        true
    }

    /// Decide and apply one reconciliation step in a single critical section.
    pub(crate) fn reconcile(
        &self,
        epoch: u64,
        snapshot: Vec<Notification>,
        authoritative: u64,
        hint: ReconcileHint,
        grace: Duration,
    ) -> Option<Reconciled> {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return None;
        }
        let now = Instant::now();

        let reason = if hint.has_new_ids {
            ResyncReason::NewArrivals
        } else if hint.size_changed {
            ResyncReason::SizeChanged
        } else {
            let expected = authoritative.saturating_sub(state.held_back_in(&snapshot, grace, now));
            if state.derived_unread() == expected && state.counter.get() == expected {
                return Some(Reconciled::Unchanged);
            }
            ResyncReason::Drift
        };

        state.replace(snapshot, Some(authoritative), grace, now);
        Some(Reconciled::Replaced(reason))
    }

    /// Set the counter from a freshly fetched authoritative count, minus the
    /// reads still awaiting confirmation.
    pub(crate) fn set_authoritative_count(
        &self,
        epoch: u64,
        authoritative: u64,
        grace: Duration,
    ) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        let now = Instant::now();
        let held_back = state
            .pending
            .keys()
            .filter(|id| state.index.contains_key(*id) && state.holds_back(id, grace, now))
            .count() as u64;
        state.counter.set(authoritative.saturating_sub(held_back));
        true
    }

    /// Optimistically mark one entry read.
    ///
    /// Returns `None` for unknown entries and entries already read, including
    /// those with a confirmation in flight.
    pub(crate) fn begin_mark_read(&self, epoch: u64, id: &NotificationId) -> Option<ReadTicket> {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return None;
        }
        let pos = state.position(id)?;
        if state.entries[pos].is_read {
            return None;
        }

        let prior = state.entries[pos].clone();
        state.entries[pos].is_read = true;
        state.counter.decrement();

        let ticket = state.issue_ticket();
        state.pending.insert(
            id.clone(),
            PendingMark {
                ticket,
                since: Instant::now(),
            },
        );

        Some(ReadTicket {
            epoch,
            ticket,
            prior,
        })
    }

    /// Settle a confirmed optimistic read.
    pub(crate) fn confirm_read(&self, ticket: &ReadTicket) -> Completion {
        let mut state = self.state.lock();
        if state.epoch != ticket.epoch {
            return Completion::Discarded;
        }
        match state.pending.get(ticket.id()) {
            Some(p) if p.ticket == ticket.ticket => {
                state.pending.remove(ticket.id());
                Completion::Applied
            }
            _ => Completion::Superseded,
        }
    }

    /// Undo a failed optimistic read, restoring the entry's prior fields.
    pub(crate) fn rollback_read(&self, ticket: &ReadTicket) -> Completion {
        let mut state = self.state.lock();
        if state.epoch != ticket.epoch {
            return Completion::Discarded;
        }
        match state.pending.get(ticket.id()) {
            Some(p) if p.ticket == ticket.ticket => {}
            _ => return Completion::Superseded,
        }
        state.pending.remove(ticket.id());

        let Some(pos) = state.position(ticket.id()) else {
            return Completion::Superseded;
        };
        if state.entries[pos].is_read && !ticket.prior.is_read {
            state.counter.increment();
        }
        state.entries[pos] = ticket.prior.clone();
        Completion::Applied
    }

    /// Optimistically mark everything read and zero the counter.
    ///
    /// Returns `None` while another bulk mark is in flight.
    pub(crate) fn begin_mark_all(&self, epoch: u64) -> Option<BulkTicket> {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.bulk_in_flight {
            return None;
        }

        let prior_entries = state.entries.clone();
        let prior_counter = state.counter;
        let now = Instant::now();

        let unread: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_read)
            .map(|(i, _)| i)
            .collect();

        let mut tickets = Vec::with_capacity(unread.len());
        for pos in unread {
            state.entries[pos].is_read = true;
            let id = state.entries[pos].id.clone();
            let ticket = state.issue_ticket();
            state.pending.insert(id.clone(), PendingMark { ticket, since: now });
            tickets.push((id, ticket));
        }

        state.counter.reset();
        state.bulk_in_flight = true;

        Some(BulkTicket {
            epoch,
            generation: state.generation,
            prior_entries,
            prior_counter,
            tickets,
        })
    }

    fn release_bulk_tickets(state: &mut CacheState, bulk: &BulkTicket) {
        state.bulk_in_flight = false;
        for (id, ticket) in &bulk.tickets {
            if state.pending.get(id).is_some_and(|p| p.ticket == *ticket) {
                state.pending.remove(id);
            }
        }
    }

    /// Settle a confirmed bulk mark.
    pub(crate) fn confirm_mark_all(&self, bulk: &BulkTicket) -> Completion {
        let mut state = self.state.lock();
        if state.epoch != bulk.epoch {
            return Completion::Discarded;
        }
        Self::release_bulk_tickets(&mut state, bulk);
        Completion::Applied
    }

    /// Undo a failed bulk mark by restoring the saved snapshot and counter.
    pub(crate) fn rollback_mark_all(&self, bulk: &BulkTicket) -> BulkRollback {
        let mut state = self.state.lock();
        if state.epoch != bulk.epoch {
            return BulkRollback::Discarded;
        }
        Self::release_bulk_tickets(&mut state, bulk);

        if state.generation != bulk.generation {
            return BulkRollback::Stale;
        }

        state.entries = bulk.prior_entries.clone();
        state.counter = bulk.prior_counter;
        state.rebuild_index();
        BulkRollback::Restored
    }
}
