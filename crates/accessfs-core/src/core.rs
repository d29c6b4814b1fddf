// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Access coordination core for AccessFS
//!
//! `AccessCore` is the facade embedders drive: it owns the entry registry,
//! the operation arbiter, the byte contents per file entry, and (with the
//! `events` feature) the change observation hub. The permission and byte
//! storage collaborators are injected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::arbiter::OperationArbiter;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::lock_table::LockTable;
use crate::registry::{validate_name, EntryRegistry};
use crate::storage::ByteStore;
use crate::types::{
    AccessRight, ContentId, ContextId, CoreStats, EntryId, EntryKind, HandleMode, LockKind,
    LockRecord, MutationKind, PermissionGate, RecordId, StreamMode,
};
#[cfg(feature = "events")]
use crate::observe::{ChangeObservationHub, RawMutation};
#[cfg(feature = "events")]
use crate::types::{ChangeSink, ChangeType};

/// The main access-coordination core
pub struct AccessCore {
    config: CoreConfig,
    registry: Arc<EntryRegistry>,
    store: Arc<dyn ByteStore>,
    permissions: Arc<dyn PermissionGate>,
    arbiter: OperationArbiter,
    #[cfg(feature = "events")]
    hub: ChangeObservationHub,
    contents: Mutex<HashMap<EntryId, ContentId>>,
    swaps: Mutex<HashMap<RecordId, ContentId>>,
    next_context_id: Mutex<u64>,
}

impl AccessCore {
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn ByteStore>,
        permissions: Arc<dyn PermissionGate>,
    ) -> Self {
        let registry = Arc::new(EntryRegistry::new());
        let table = Arc::new(LockTable::new());
        let arbiter = OperationArbiter::new(
            registry.clone(),
            table,
            permissions.clone(),
            config.limits.clone(),
        );
        #[cfg(feature = "events")]
        let hub = ChangeObservationHub::new(
            registry.clone(),
            config.notify.clone(),
            config.limits.max_subscriptions,
        );

        Self {
            config,
            registry,
            store,
            permissions,
            arbiter,
            #[cfg(feature = "events")]
            hub,
            contents: Mutex::new(HashMap::new()),
            swaps: Mutex::new(HashMap::new()),
            next_context_id: Mutex::new(1),
        }
    }

    // Context lifecycle

    pub fn register_context(&self) -> ContextId {
        let mut next_id = self.next_context_id.lock().unwrap();
        let ctx = ContextId::new(*next_id);
        *next_id += 1;
        ctx
    }

    /// Release everything a context owns: lock records, stream swaps, and
    /// subscriptions. Required cleanup hook for tab/worker teardown; never
    /// fails.
    pub fn teardown_context(&self, ctx: ContextId) {
        let released = self.arbiter.teardown_context(ctx);
        let mut swaps = self.swaps.lock().unwrap();
        for record in released {
            if let Some(swap) = swaps.remove(&record.id) {
                let _ = self.store.discard(swap);
            }
        }
        drop(swaps);
        #[cfg(feature = "events")]
        self.hub.disconnect_all(ctx);
        debug!(?ctx, "context torn down");
    }

    // Entry lookup

    pub fn root(&self) -> EntryId {
        self.registry.root()
    }

    pub fn resolve(&self, path: &Path) -> CoreResult<EntryId> {
        self.registry.resolve(path)
    }

    pub fn kind_of(&self, entry: EntryId) -> CoreResult<EntryKind> {
        self.registry.kind_of(entry)
    }

    // Tree building

    pub fn create_file(
        &self,
        ctx: ContextId,
        parent: EntryId,
        name: &str,
    ) -> CoreResult<EntryId> {
        self.create_entry(ctx, parent, name, EntryKind::File)
    }

    pub fn create_dir(
        &self,
        ctx: ContextId,
        parent: EntryId,
        name: &str,
    ) -> CoreResult<EntryId> {
        self.create_entry(ctx, parent, name, EntryKind::Directory)
    }

    fn create_entry(
        &self,
        ctx: ContextId,
        parent: EntryId,
        name: &str,
        kind: EntryKind,
    ) -> CoreResult<EntryId> {
        self.check_permission(ctx, parent, AccessRight::Write)?;
        validate_name(name)?;

        let (entry, created) = self.registry.ensure(parent, name, kind)?;
        if created {
            if kind == EntryKind::File {
                let content = self.store.allocate(&[])?;
                self.contents.lock().unwrap().insert(entry, content);
            }
            debug!(%entry, name, ?kind, "entry created");
            #[cfg(feature = "events")]
            self.emit_change(entry, ChangeType::Created, None);
        }
        Ok(entry)
    }

    // Sync access handles

    /// Open a sync access handle. `ReadOnly` requires a read grant, the
    /// write-capable modes a write grant.
    pub fn open_sync_handle(
        &self,
        ctx: ContextId,
        entry: EntryId,
        mode: HandleMode,
    ) -> CoreResult<LockRecord> {
        let right = if mode.is_writable() {
            AccessRight::Write
        } else {
            AccessRight::Read
        };
        self.check_permission(ctx, entry, right)?;
        self.arbiter.open_handle(ctx, entry, mode)
    }

    pub fn handle_read(
        &self,
        record: &LockRecord,
        offset: u64,
        buf: &mut [u8],
    ) -> CoreResult<usize> {
        self.handle_mode(record)?;
        let content = self.content_of(record.entry)?;
        self.store.read(content, offset, buf)
    }

    /// Write through a sync access handle. The change signal is emitted
    /// best-effort after the bytes land; the write never waits for
    /// delivery.
    pub fn handle_write(
        &self,
        record: &LockRecord,
        offset: u64,
        data: &[u8],
    ) -> CoreResult<usize> {
        let mode = self.handle_mode(record)?;
        if !mode.is_writable() {
            return Err(CoreError::NoModificationAllowed);
        }
        let content = self.content_of(record.entry)?;
        let written = self.store.write(content, offset, data)?;
        #[cfg(feature = "events")]
        self.emit_change(record.entry, ChangeType::Modified, None);
        Ok(written)
    }

    pub fn handle_truncate(&self, record: &LockRecord, new_len: u64) -> CoreResult<()> {
        let mode = self.handle_mode(record)?;
        if !mode.is_writable() {
            return Err(CoreError::NoModificationAllowed);
        }
        let content = self.content_of(record.entry)?;
        self.store.truncate(content, new_len)?;
        #[cfg(feature = "events")]
        self.emit_change(record.entry, ChangeType::Modified, None);
        Ok(())
    }

    pub fn handle_size(&self, record: &LockRecord) -> CoreResult<u64> {
        self.handle_mode(record)?;
        let content = self.content_of(record.entry)?;
        self.store.len(content)
    }

    /// Close a sync access handle; idempotent, never fails
    pub fn close_handle(&self, record: &LockRecord) {
        if record.class.kind() == LockKind::SyncHandle {
            self.arbiter.close_primitive(record);
        }
    }

    fn handle_mode(&self, record: &LockRecord) -> CoreResult<HandleMode> {
        match record.class {
            crate::types::LockRequest::SyncHandle(mode) => Ok(mode),
            _ => Err(CoreError::NotSupported),
        }
    }

    // Writable streams

    /// Open a writable stream. Stream writes land in swap content that is
    /// only committed on a clean close.
    pub fn open_stream(
        &self,
        ctx: ContextId,
        entry: EntryId,
        mode: StreamMode,
        keep_existing_data: bool,
    ) -> CoreResult<LockRecord> {
        self.check_permission(ctx, entry, AccessRight::Write)?;
        let record = self.arbiter.open_stream(ctx, entry, mode)?;

        let swap = if keep_existing_data {
            let content = self.content_of(entry)?;
            self.store.clone_content(content)
        } else {
            self.store.allocate(&[])
        };
        match swap {
            Ok(swap) => {
                self.swaps.lock().unwrap().insert(record.id, swap);
                Ok(record)
            }
            Err(err) => {
                // Swap allocation failed; the lock must not leak.
                self.arbiter.close_primitive(&record);
                Err(err)
            }
        }
    }

    pub fn stream_write(
        &self,
        record: &LockRecord,
        offset: u64,
        data: &[u8],
    ) -> CoreResult<usize> {
        let swap = self.swap_of(record)?;
        self.store.write(swap, offset, data)
    }

    /// Commit the swap content and release the stream lock. The lock is
    /// released even when the commit fails.
    pub fn close_stream(&self, record: &LockRecord) -> CoreResult<()> {
        let swap = self.swaps.lock().unwrap().remove(&record.id);
        let result = match swap {
            Some(swap) => self.commit_swap(record.entry, swap),
            None => Ok(()), // already closed or aborted
        };
        self.arbiter.close_primitive(record);
        result
    }

    /// Discard the swap content and release the stream lock; the target
    /// entry keeps its previous bytes. Idempotent, never fails.
    pub fn abort_stream(&self, record: &LockRecord) {
        if let Some(swap) = self.swaps.lock().unwrap().remove(&record.id) {
            let _ = self.store.discard(swap);
        }
        self.arbiter.close_primitive(record);
    }

    fn commit_swap(&self, entry: EntryId, swap: ContentId) -> CoreResult<()> {
        let previous = self.contents.lock().unwrap().insert(entry, swap);
        if let Some(previous) = previous {
            let _ = self.store.discard(previous);
        }
        #[cfg(feature = "events")]
        self.emit_change(entry, ChangeType::Modified, None);
        Ok(())
    }

    fn swap_of(&self, record: &LockRecord) -> CoreResult<ContentId> {
        if record.class.kind() != LockKind::Stream {
            return Err(CoreError::NotSupported);
        }
        self.swaps
            .lock()
            .unwrap()
            .get(&record.id)
            .copied()
            .ok_or(CoreError::NotFound)
    }

    // Mutating operations

    /// Move an entry under a new parent with a new name. Overwrites an
    /// existing unlocked file destination; directory destinations are
    /// never overwritten.
    pub fn move_entry(
        &self,
        ctx: ContextId,
        entry: EntryId,
        new_parent: EntryId,
        new_name: &str,
    ) -> CoreResult<()> {
        self.check_permission(ctx, entry, AccessRight::Write)?;
        self.check_permission(ctx, new_parent, AccessRight::Write)?;
        validate_name(new_name)?;
        if self.registry.kind_of(new_parent)? != EntryKind::Directory {
            return Err(CoreError::NotSupported);
        }
        if self.registry.is_ancestor_or_self(entry, new_parent) {
            return Err(CoreError::NoModificationAllowed);
        }

        let old_path = self.registry.path_of(entry)?;
        let dest = self.registry.child_of(new_parent, new_name)?;
        if dest == Some(entry) {
            return Ok(()); // no-op move
        }
        let guard = self.arbiter.begin_mutation(ctx, entry, MutationKind::Move, dest)?;
        let result = self.perform_move(entry, new_parent, new_name, dest);
        self.arbiter.end_mutation(&guard);
        result?;

        #[cfg(feature = "events")]
        self.emit_move(entry, old_path);
        #[cfg(not(feature = "events"))]
        let _ = old_path;
        Ok(())
    }

    fn perform_move(
        &self,
        entry: EntryId,
        new_parent: EntryId,
        new_name: &str,
        dest: Option<EntryId>,
    ) -> CoreResult<()> {
        if let Some(dest) = dest {
            if self.registry.kind_of(dest)? == EntryKind::Directory {
                return Err(CoreError::NoModificationAllowed);
            }
            self.registry.remove_subtree(dest)?;
            if let Some(content) = self.contents.lock().unwrap().remove(&dest) {
                let _ = self.store.discard(content);
            }
        }
        self.registry.reparent(entry, new_parent, new_name)
    }

    /// Remove an entry. A non-empty directory is only removed when
    /// `recursive` is set.
    pub fn remove_entry(
        &self,
        ctx: ContextId,
        entry: EntryId,
        recursive: bool,
    ) -> CoreResult<()> {
        self.remove_with_kind(ctx, entry, recursive, MutationKind::Remove)
    }

    /// Remove a named child of a directory (the original removeEntry shape)
    pub fn remove_child(
        &self,
        ctx: ContextId,
        dir: EntryId,
        name: &str,
        recursive: bool,
    ) -> CoreResult<()> {
        let child = self.registry.child_of(dir, name)?.ok_or(CoreError::NotFound)?;
        self.remove_with_kind(ctx, child, recursive, MutationKind::RemoveEntry)
    }

    fn remove_with_kind(
        &self,
        ctx: ContextId,
        entry: EntryId,
        recursive: bool,
        kind: MutationKind,
    ) -> CoreResult<()> {
        self.check_permission(ctx, entry, AccessRight::Write)?;

        let old_path = self.registry.path_of(entry)?;
        let guard = self.arbiter.begin_mutation(ctx, entry, kind, None)?;
        let result = self.perform_remove(entry, recursive);
        self.arbiter.end_mutation(&guard);
        let removed = result?;

        let mut contents = self.contents.lock().unwrap();
        for id in &removed {
            if let Some(content) = contents.remove(id) {
                let _ = self.store.discard(content);
            }
        }
        drop(contents);

        debug!(%entry, "entry removed");
        #[cfg(feature = "events")]
        self.emit_raw(RawMutation {
            entry,
            change: ChangeType::Deleted,
            path: old_path,
            moved_from: None,
        });
        #[cfg(not(feature = "events"))]
        let _ = old_path;
        Ok(())
    }

    fn perform_remove(&self, entry: EntryId, recursive: bool) -> CoreResult<Vec<EntryId>> {
        if self.registry.kind_of(entry)? == EntryKind::Directory
            && !recursive
            && self.registry.has_children(entry)?
        {
            return Err(CoreError::NoModificationAllowed);
        }
        self.registry.remove_subtree(entry)
    }

    // Observation

    #[cfg(feature = "events")]
    pub fn observe(
        &self,
        ctx: ContextId,
        entry: EntryId,
        recursive: bool,
        sink: Arc<dyn ChangeSink>,
    ) -> CoreResult<()> {
        if !self.permissions.allows(ctx, entry, AccessRight::Read) {
            return Err(CoreError::PermissionDenied);
        }
        self.hub.observe(ctx, entry, recursive, sink)
    }

    #[cfg(feature = "events")]
    pub fn unobserve(&self, ctx: ContextId, entry: EntryId) {
        self.hub.unobserve(ctx, entry);
    }

    #[cfg(feature = "events")]
    pub fn disconnect(&self, ctx: ContextId) {
        self.hub.disconnect_all(ctx);
    }

    /// Block until every change published so far has been delivered
    #[cfg(feature = "events")]
    pub fn flush_changes(&self) {
        self.hub.flush();
    }

    // Diagnostics

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            entries: self.registry.len(),
            open_primitives: self.arbiter.open_primitive_count(),
            #[cfg(feature = "events")]
            subscriptions: self.hub.subscription_count(),
            #[cfg(not(feature = "events"))]
            subscriptions: 0,
        }
    }

    pub fn lock_summary(&self, entry: EntryId) -> Option<crate::types::LockSummary> {
        self.arbiter.summary(entry)
    }

    /// One-shot wakeup when an entry's lock set drains; callers re-request
    /// acquisition themselves.
    pub fn on_entry_free(&self, entry: EntryId, waker: Box<dyn FnOnce() + Send>) {
        self.arbiter.on_entry_free(entry, waker);
    }

    // Internal helpers

    fn check_permission(
        &self,
        ctx: ContextId,
        entry: EntryId,
        right: AccessRight,
    ) -> CoreResult<()> {
        if self.permissions.allows(ctx, entry, right) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied)
        }
    }

    fn content_of(&self, entry: EntryId) -> CoreResult<ContentId> {
        self.contents.lock().unwrap().get(&entry).copied().ok_or(CoreError::NotFound)
    }

    #[cfg(feature = "events")]
    fn emit_change(&self, entry: EntryId, change: ChangeType, moved_from: Option<Vec<String>>) {
        if !self.config.track_changes {
            return;
        }
        let Ok(path) = self.registry.path_of(entry) else {
            return;
        };
        self.hub.publish(RawMutation {
            entry,
            change,
            path,
            moved_from,
        });
    }

    #[cfg(feature = "events")]
    fn emit_move(&self, entry: EntryId, old_path: Vec<String>) {
        self.emit_change(entry, ChangeType::Moved, Some(old_path));
    }

    #[cfg(feature = "events")]
    fn emit_raw(&self, mutation: RawMutation) {
        if !self.config.track_changes {
            return;
        }
        self.hub.publish(mutation);
    }
}
