// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-entry lock state for AccessFS Core
//!
//! All active records on an entry share one lock class; admission within a
//! class follows the compatibility tables below. Ancestor marker counts
//! live in the same table state so arbiter checks observe records and
//! markers under a single lock.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::types::{ContextId, EntryId, LockRecord, LockRequest, LockSummary, RecordId};

/// Why an acquisition was refused. Collapsed to a single coarse error at
/// the arbiter boundary so callers cannot distinguish conflict sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DenyReason {
    CrossTypeConflict,
    ModeConflict,
}

// Sync-access-handle mode compatibility, indexed by HandleMode::index()
// (ReadOnly, ReadWrite, ReadWriteUnsafe). ReadWrite is exclusive; the
// shared modes only coexist with themselves.
const HANDLE_COMPAT: [[bool; 3]; 3] = [
    [true, false, false],
    [false, false, false],
    [false, false, true],
];

// Writable-stream mode compatibility, indexed by StreamMode::index()
// (Exclusive, Siloed).
const STREAM_COMPAT: [[bool; 2]; 2] = [
    [false, false],
    [false, true],
];

fn compatible(active: LockRequest, requested: LockRequest) -> bool {
    match (active, requested) {
        (LockRequest::SyncHandle(a), LockRequest::SyncHandle(r)) => {
            HANDLE_COMPAT[a.index()][r.index()]
        }
        (LockRequest::Stream(a), LockRequest::Stream(r)) => STREAM_COMPAT[a.index()][r.index()],
        // Mutations are exclusive against everything, themselves included.
        (LockRequest::Mutation, LockRequest::Mutation) => false,
        _ => false,
    }
}

struct EntryLocks {
    class: LockRequest,
    holders: HashMap<RecordId, ContextId>,
}

type Waker = Box<dyn FnOnce() + Send>;

struct TableState {
    active: HashMap<EntryId, EntryLocks>,
    markers: HashMap<EntryId, u64>,
    wakers: HashMap<EntryId, Vec<Waker>>,
    next_record_id: u64,
}

/// Source of truth for all lock checks
pub(crate) struct LockTable {
    state: Mutex<TableState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                active: HashMap::new(),
                markers: HashMap::new(),
                wakers: HashMap::new(),
                next_record_id: 1,
            }),
        }
    }

    /// Atomic admit-or-nothing acquisition
    pub fn try_acquire(
        &self,
        entry: EntryId,
        class: LockRequest,
        holder: ContextId,
    ) -> Result<LockRecord, DenyReason> {
        let mut state = self.state.lock().unwrap();

        if let Some(locks) = state.active.get(&entry) {
            if locks.class.kind() != class.kind() {
                debug!(%entry, ?class, active = ?locks.class, "acquire denied: cross-type");
                return Err(DenyReason::CrossTypeConflict);
            }
            if !compatible(locks.class, class) {
                debug!(%entry, ?class, active = ?locks.class, "acquire denied: mode");
                return Err(DenyReason::ModeConflict);
            }
        }

        let id = RecordId::new(state.next_record_id);
        state.next_record_id += 1;
        let locks = state.active.entry(entry).or_insert_with(|| EntryLocks {
            class,
            holders: HashMap::new(),
        });
        locks.holders.insert(id, holder);
        debug!(%entry, ?class, holders = locks.holders.len(), "acquired");

        Ok(LockRecord {
            id,
            entry,
            class,
            holder,
        })
    }

    /// Remove a record. Idempotent: returns false if it was already gone.
    /// Wakers registered for the entry fire once the active set drains.
    pub fn release(&self, record: &LockRecord) -> bool {
        let mut state = self.state.lock().unwrap();
        let removed = match state.active.get_mut(&record.entry) {
            Some(locks) => locks.holders.remove(&record.id).is_some(),
            None => false,
        };
        if !removed {
            return false;
        }

        let mut wakers = Vec::new();
        if state.active.get(&record.entry).is_some_and(|l| l.holders.is_empty()) {
            state.active.remove(&record.entry);
            if let Some(pending) = state.wakers.remove(&record.entry) {
                wakers = pending;
            }
        }
        drop(state);

        debug!(entry = %record.entry, "released");
        // Fired outside the table lock; a waker may immediately re-request.
        for waker in wakers {
            waker();
        }
        true
    }

    pub fn summary(&self, entry: EntryId) -> Option<LockSummary> {
        let state = self.state.lock().unwrap();
        state.active.get(&entry).map(|locks| LockSummary {
            class: locks.class,
            holder_count: locks.holders.len(),
        })
    }

    /// Count of open handle/stream records across all entries
    pub fn primitive_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .active
            .values()
            .filter(|l| !matches!(l.class, LockRequest::Mutation))
            .map(|l| l.holders.len())
            .sum()
    }

    /// Register a one-shot notification for the entry's next transition to
    /// zero active records. Fires immediately if the entry is already free.
    /// Acquisition is never retried on the caller's behalf.
    pub fn on_free(&self, entry: EntryId, waker: Waker) {
        let mut state = self.state.lock().unwrap();
        if state.active.contains_key(&entry) {
            state.wakers.entry(entry).or_default().push(waker);
        } else {
            drop(state);
            waker();
        }
    }

    /// Release everything owned by a context; returns the removed records
    /// so the caller can unwind ancestor markers and swap state.
    pub fn release_holder(&self, holder: ContextId) -> Vec<LockRecord> {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        let mut freed = Vec::new();

        state.active.retain(|entry, locks| {
            locks.holders.retain(|record_id, record_holder| {
                if *record_holder == holder {
                    removed.push(LockRecord {
                        id: *record_id,
                        entry: *entry,
                        class: locks.class,
                        holder,
                    });
                    false
                } else {
                    true
                }
            });
            if locks.holders.is_empty() {
                freed.push(*entry);
                false
            } else {
                true
            }
        });

        let mut wakers = Vec::new();
        for entry in freed {
            if let Some(pending) = state.wakers.remove(&entry) {
                wakers.extend(pending);
            }
        }
        drop(state);

        for waker in wakers {
            waker();
        }
        removed
    }

    pub fn marker_count(&self, entry: EntryId) -> u64 {
        let state = self.state.lock().unwrap();
        state.markers.get(&entry).copied().unwrap_or(0)
    }

    pub fn add_marker(&self, entry: EntryId) {
        let mut state = self.state.lock().unwrap();
        *state.markers.entry(entry).or_insert(0) += 1;
    }

    /// Panics on underflow: a decrement without a matching increment is a
    /// lock/unlock mismatch in the caller, not a user-facing condition.
    pub fn remove_marker(&self, entry: EntryId) {
        let mut state = self.state.lock().unwrap();
        let count = match state.markers.get_mut(&entry) {
            Some(count) => count,
            None => panic!("ancestor marker underflow on {entry}"),
        };
        *count -= 1;
        if *count == 0 {
            state.markers.remove(&entry);
        }
    }
}
