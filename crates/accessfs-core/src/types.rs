// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for AccessFS

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier for a file-system entry.
///
/// Identity survives renames; only removal invalidates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

/// Identity of an execution context (tab, worker, agent).
///
/// Contexts own lock records and subscriptions; tearing a context down
/// releases everything it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl ContextId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque lock record identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Content identifier for the byte store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentId(pub u64);

impl ContentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Entry kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Sharing mode for a sync access handle.
///
/// `ReadWrite` is exclusive. `ReadOnly` coexists only with other `ReadOnly`
/// holders; `ReadWriteUnsafe` only with other `ReadWriteUnsafe` holders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleMode {
    ReadOnly,
    ReadWrite,
    ReadWriteUnsafe,
}

impl HandleMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, HandleMode::ReadOnly)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            HandleMode::ReadOnly => 0,
            HandleMode::ReadWrite => 1,
            HandleMode::ReadWriteUnsafe => 2,
        }
    }
}

/// Sharing mode for a writable stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    Exclusive,
    Siloed,
}

impl StreamMode {
    pub(crate) fn index(&self) -> usize {
        match self {
            StreamMode::Exclusive => 0,
            StreamMode::Siloed => 1,
        }
    }
}

/// Kind of a short-lived mutating operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Move,
    Remove,
    RemoveEntry,
}

/// The lock class requested for (and admitted on) an entry.
///
/// At most one class may have active holders on an entry at any instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRequest {
    SyncHandle(HandleMode),
    Stream(StreamMode),
    Mutation,
}

impl LockRequest {
    pub fn kind(&self) -> LockKind {
        match self {
            LockRequest::SyncHandle(_) => LockKind::SyncHandle,
            LockRequest::Stream(_) => LockKind::Stream,
            LockRequest::Mutation => LockKind::Mutation,
        }
    }
}

/// Lock type without its sharing mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    SyncHandle,
    Stream,
    Mutation,
}

/// One active hold on an entry, returned on successful acquisition and
/// passed back on release. Release is idempotent.
#[derive(Clone, Debug)]
pub struct LockRecord {
    pub(crate) id: RecordId,
    pub(crate) entry: EntryId,
    pub(crate) class: LockRequest,
    pub(crate) holder: ContextId,
}

impl LockRecord {
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn holder(&self) -> ContextId {
        self.holder
    }

    pub fn class(&self) -> LockRequest {
        self.class
    }
}

/// Snapshot of an entry's active lock state, for diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockSummary {
    pub class: LockRequest,
    pub holder_count: usize,
}

/// Change kinds delivered to observers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Deleted,
    Modified,
    Moved,
    Unsupported,
    Errored,
}

/// A change record as delivered to an observer, relative to the
/// subscription root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub root: EntryId,
    pub changed_entry: EntryId,
    pub path_from_root: Vec<String>,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_from_path: Option<Vec<String>>,
}

/// Sink trait for receiving batched change records
pub trait ChangeSink: Send + Sync {
    fn on_change_records(&self, records: &[ChangeRecord]);
}

/// Access right checked against the permission collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessRight {
    Read,
    Write,
}

/// Permission collaborator: answers whether a context currently holds a
/// grant for an entry. The user-interaction half of granting lives outside
/// the core; by the time the core asks, the answer is synchronous.
#[cfg_attr(test, mockall::automock)]
pub trait PermissionGate: Send + Sync {
    fn allows(&self, ctx: ContextId, entry: EntryId, right: AccessRight) -> bool;
}

/// Permission gate that grants everything; useful for embedders that do
/// their own gating, and for tests.
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn allows(&self, _ctx: ContextId, _entry: EntryId, _right: AccessRight) -> bool {
        true
    }
}

/// Engine statistics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreStats {
    pub entries: usize,
    pub open_primitives: usize,
    pub subscriptions: usize,
}
