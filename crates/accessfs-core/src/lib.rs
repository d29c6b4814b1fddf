// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! AccessFS Core: file-entry locking and access coordination
//!
//! The core arbitrates concurrent access to file-system entries by
//! independent execution contexts: read/write sync access handles,
//! writable streams, and short-lived mutating operations (move/remove)
//! are mutually exclusive per entry, with fine-grained sharing inside
//! each class. Locking effects propagate up the directory tree so that
//! ancestors of a locked entry cannot be moved or removed, and subtree
//! observers receive best-effort, coalesced change records without the
//! synchronous I/O path ever waiting on delivery.

pub mod config;
pub mod core;
pub mod error;
#[cfg(feature = "events")]
pub mod observe;
pub mod registry;
pub mod storage;
pub mod types;

mod arbiter;
mod lock_table;
mod propagate;

pub use crate::core::AccessCore;
pub use config::{CoreConfig, CoreLimits, NotifyPolicy};
pub use error::{CoreError, CoreResult};
#[cfg(feature = "events")]
pub use observe::RawMutation;
pub use registry::{validate_name, EntryRegistry};
pub use storage::{ByteStore, InMemoryByteStore};
pub use types::{
    AccessRight, AllowAll, ChangeRecord, ChangeSink, ChangeType, ContentId, ContextId,
    CoreStats, EntryId, EntryKind, HandleMode, LockKind, LockRecord, LockRequest, LockSummary,
    MutationKind, PermissionGate, RecordId, StreamMode,
};
