// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation arbitration for AccessFS Core
//!
//! The arbiter is the single gate through which locks are taken and
//! released. Compound sequences (acquire + ancestor marking, mutation
//! precondition checks) run behind one ops mutex so concurrent
//! `begin_mutation` calls never observe a half-propagated marker chain.
//!
//! All denials are synchronous and collapsed to `NoModificationAllowed`;
//! the arbiter never queues or retries a denied request.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::CoreLimits;
use crate::error::{CoreError, CoreResult};
use crate::lock_table::LockTable;
use crate::propagate::PathLockPropagator;
use crate::registry::EntryRegistry;
use crate::types::{
    AccessRight, ContextId, EntryId, EntryKind, HandleMode, LockRecord, LockRequest,
    MutationKind, PermissionGate, StreamMode,
};

/// Records held for the duration of one mutating operation: the entry
/// itself and, for a move onto an existing destination, the destination.
/// Both are released together in `end_mutation`.
pub(crate) struct MutationGuard {
    record: LockRecord,
    dest: Option<LockRecord>,
}

pub(crate) struct OperationArbiter {
    registry: Arc<EntryRegistry>,
    table: Arc<LockTable>,
    propagator: PathLockPropagator,
    permissions: Arc<dyn PermissionGate>,
    limits: CoreLimits,
    // Serializes compound check-then-mutate sequences.
    ops: Mutex<()>,
}

impl OperationArbiter {
    pub fn new(
        registry: Arc<EntryRegistry>,
        table: Arc<LockTable>,
        permissions: Arc<dyn PermissionGate>,
        limits: CoreLimits,
    ) -> Self {
        let propagator = PathLockPropagator::new(registry.clone(), table.clone());
        Self {
            registry,
            table,
            propagator,
            permissions,
            limits,
            ops: Mutex::new(()),
        }
    }

    pub fn open_handle(
        &self,
        ctx: ContextId,
        entry: EntryId,
        mode: HandleMode,
    ) -> CoreResult<LockRecord> {
        self.open_primitive(ctx, entry, LockRequest::SyncHandle(mode))
    }

    pub fn open_stream(
        &self,
        ctx: ContextId,
        entry: EntryId,
        mode: StreamMode,
    ) -> CoreResult<LockRecord> {
        self.open_primitive(ctx, entry, LockRequest::Stream(mode))
    }

    fn open_primitive(
        &self,
        ctx: ContextId,
        entry: EntryId,
        class: LockRequest,
    ) -> CoreResult<LockRecord> {
        let _ops = self.ops.lock().unwrap();

        if self.registry.kind_of(entry)? != EntryKind::File {
            return Err(CoreError::NotSupported);
        }
        if self.table.primitive_count() >= self.limits.max_open_primitives {
            return Err(CoreError::TooManyOpenPrimitives);
        }

        let record = self
            .table
            .try_acquire(entry, class, ctx)
            .map_err(|_| CoreError::NoModificationAllowed)?;
        self.propagator.mark_ancestors(entry)?;
        Ok(record)
    }

    /// Close a handle or stream record. Idempotent and infallible: a
    /// record that is already gone leaves markers untouched.
    pub fn close_primitive(&self, record: &LockRecord) {
        let _ops = self.ops.lock().unwrap();
        if self.table.release(record) {
            // The entry could not have moved while the record was held.
            let _ = self.propagator.unmark_ancestors(record.entry);
        }
    }

    /// Begin a short-lived exclusive mutating operation.
    ///
    /// Checked atomically: the entry has zero active records of any type,
    /// zero descendant markers, and for a move onto an existing
    /// destination the caller holds write permission there and the
    /// destination is equally unencumbered. The destination is then locked
    /// alongside the entry so nothing can open it while the overwrite is
    /// in flight.
    pub fn begin_mutation(
        &self,
        ctx: ContextId,
        entry: EntryId,
        kind: MutationKind,
        move_dest: Option<EntryId>,
    ) -> CoreResult<MutationGuard> {
        let _ops = self.ops.lock().unwrap();

        self.registry.kind_of(entry)?;
        if self.table.marker_count(entry) > 0 {
            debug!(%entry, ?kind, "mutation denied: locked descendant");
            return Err(CoreError::NoModificationAllowed);
        }
        if let Some(dest) = move_dest {
            if !self.permissions.allows(ctx, dest, AccessRight::Write) {
                debug!(%entry, %dest, "mutation denied: destination not writable");
                return Err(CoreError::NoModificationAllowed);
            }
            if self.table.summary(dest).is_some() || self.table.marker_count(dest) > 0 {
                debug!(%entry, %dest, "mutation denied: destination locked");
                return Err(CoreError::NoModificationAllowed);
            }
        }

        let record = self
            .table
            .try_acquire(entry, LockRequest::Mutation, ctx)
            .map_err(|_| CoreError::NoModificationAllowed)?;
        let dest = match move_dest {
            Some(dest) => match self.table.try_acquire(dest, LockRequest::Mutation, ctx) {
                Ok(dest_record) => Some(dest_record),
                Err(_) => {
                    self.table.release(&record);
                    return Err(CoreError::NoModificationAllowed);
                }
            },
            None => None,
        };
        debug!(%entry, ?kind, "mutation begun");
        Ok(MutationGuard { record, dest })
    }

    /// End a mutating operation, releasing the entry record and any
    /// destination record. Must be called whether the storage step
    /// succeeded or failed; releasing twice is a no-op.
    pub fn end_mutation(&self, guard: &MutationGuard) {
        let _ops = self.ops.lock().unwrap();
        if let Some(dest) = &guard.dest {
            self.table.release(dest);
        }
        self.table.release(&guard.record);
    }

    /// One-shot notification for the entry's next transition to free.
    ///
    /// The waker runs on the releasing thread and must not call back into
    /// the arbiter synchronously; it is a signal to re-request, not an
    /// admission.
    pub fn on_entry_free(&self, entry: EntryId, waker: Box<dyn FnOnce() + Send>) {
        self.table.on_free(entry, waker);
    }

    pub fn summary(&self, entry: EntryId) -> Option<crate::types::LockSummary> {
        self.table.summary(entry)
    }

    pub fn open_primitive_count(&self) -> usize {
        self.table.primitive_count()
    }

    /// Release every record owned by a context, unwinding markers for the
    /// primitive-type records. Returns what was released so the caller can
    /// drop per-record state. Never fails.
    pub fn teardown_context(&self, ctx: ContextId) -> Vec<LockRecord> {
        let _ops = self.ops.lock().unwrap();
        let removed = self.table.release_holder(ctx);
        for record in &removed {
            if record.class.kind() != crate::types::LockKind::Mutation {
                let _ = self.propagator.unmark_ancestors(record.entry);
            }
        }
        if !removed.is_empty() {
            debug!(?ctx, count = removed.len(), "context teardown released records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AllowAll, MockPermissionGate};

    fn setup() -> (Arc<EntryRegistry>, OperationArbiter, EntryId, EntryId) {
        setup_with_gate(Arc::new(AllowAll))
    }

    fn setup_with_gate(
        gate: Arc<dyn PermissionGate>,
    ) -> (Arc<EntryRegistry>, OperationArbiter, EntryId, EntryId) {
        let registry = Arc::new(EntryRegistry::new());
        let table = Arc::new(LockTable::new());
        let root = registry.root();
        let (dir, _) = registry.ensure(root, "dir", EntryKind::Directory).unwrap();
        let (file, _) = registry.ensure(dir, "foo.txt", EntryKind::File).unwrap();
        let arbiter =
            OperationArbiter::new(registry.clone(), table, gate, CoreLimits::default());
        (registry, arbiter, dir, file)
    }

    const CTX: ContextId = ContextId(1);
    const OTHER: ContextId = ContextId(2);

    #[test]
    fn test_open_handle_marks_ancestors() {
        let (registry, arbiter, dir, file) = setup();
        let root = registry.root();

        let rec = arbiter.open_handle(CTX, file, HandleMode::ReadWrite).unwrap();
        assert!(arbiter
            .begin_mutation(CTX, dir, MutationKind::Remove, None)
            .is_err());
        assert!(arbiter
            .begin_mutation(CTX, root, MutationKind::Remove, None)
            .is_err());

        arbiter.close_primitive(&rec);
        let rec = arbiter.begin_mutation(CTX, dir, MutationKind::Remove, None).unwrap();
        arbiter.end_mutation(&rec);
    }

    #[test]
    fn test_mutation_denied_while_handle_open() {
        let (_registry, arbiter, _dir, file) = setup();

        let rec = arbiter.open_handle(CTX, file, HandleMode::ReadWrite).unwrap();
        assert!(matches!(
            arbiter.begin_mutation(CTX, file, MutationKind::Remove, None),
            Err(CoreError::NoModificationAllowed)
        ));

        arbiter.close_primitive(&rec);
        assert!(arbiter.begin_mutation(CTX, file, MutationKind::Remove, None).is_ok());
    }

    #[test]
    fn test_open_handle_on_directory_not_supported() {
        let (_registry, arbiter, dir, _file) = setup();
        assert!(matches!(
            arbiter.open_handle(CTX, dir, HandleMode::ReadOnly),
            Err(CoreError::NotSupported)
        ));
    }

    #[test]
    fn test_close_is_idempotent_for_markers() {
        let (_registry, arbiter, dir, file) = setup();

        let rec = arbiter.open_handle(CTX, file, HandleMode::ReadOnly).unwrap();
        arbiter.close_primitive(&rec);
        // A second close must not decrement markers again.
        arbiter.close_primitive(&rec);

        let rec = arbiter.begin_mutation(CTX, dir, MutationKind::Remove, None).unwrap();
        arbiter.end_mutation(&rec);
    }

    #[test]
    fn test_move_denied_onto_locked_destination() {
        let (registry, arbiter, dir, file) = setup();
        let (dest, _) = registry.ensure(dir, "dest.txt", EntryKind::File).unwrap();

        let held = arbiter.open_handle(CTX, dest, HandleMode::ReadOnly).unwrap();
        assert!(matches!(
            arbiter.begin_mutation(CTX, file, MutationKind::Move, Some(dest)),
            Err(CoreError::NoModificationAllowed)
        ));

        arbiter.close_primitive(&held);
        assert!(arbiter
            .begin_mutation(CTX, file, MutationKind::Move, Some(dest))
            .is_ok());
    }

    #[test]
    fn test_move_destination_locked_while_mutation_in_flight() {
        let (registry, arbiter, dir, file) = setup();
        let (dest, _) = registry.ensure(dir, "dest.txt", EntryKind::File).unwrap();

        // A handle opened on the destination between the admission check
        // and the overwrite would be orphaned by the subtree removal, so
        // the destination must carry a record for the whole operation.
        let guard = arbiter
            .begin_mutation(CTX, file, MutationKind::Move, Some(dest))
            .unwrap();
        assert!(matches!(
            arbiter.open_handle(OTHER, dest, HandleMode::ReadOnly),
            Err(CoreError::NoModificationAllowed)
        ));
        registry.remove_subtree(dest).unwrap();
        arbiter.end_mutation(&guard);

        // No markers leaked: the parent stays removable.
        let guard = arbiter.begin_mutation(CTX, dir, MutationKind::Remove, None).unwrap();
        arbiter.end_mutation(&guard);
    }

    #[test]
    fn test_move_denied_without_destination_write_grant() {
        let mut gate = MockPermissionGate::new();
        gate.expect_allows().return_const(false);
        let (registry, arbiter, dir, file) = setup_with_gate(Arc::new(gate));
        let (dest, _) = registry.ensure(dir, "dest.txt", EntryKind::File).unwrap();

        assert!(matches!(
            arbiter.begin_mutation(CTX, file, MutationKind::Move, Some(dest)),
            Err(CoreError::NoModificationAllowed)
        ));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (_registry, arbiter, dir, file) = setup();

        arbiter.open_handle(CTX, file, HandleMode::ReadWriteUnsafe).unwrap();
        arbiter.open_handle(CTX, file, HandleMode::ReadWriteUnsafe).unwrap();
        assert_eq!(arbiter.open_primitive_count(), 2);

        let removed = arbiter.teardown_context(CTX);
        assert_eq!(removed.len(), 2);
        assert_eq!(arbiter.open_primitive_count(), 0);

        // Markers unwound: parent is mutable again.
        let rec = arbiter.begin_mutation(CTX, dir, MutationKind::Remove, None).unwrap();
        arbiter.end_mutation(&rec);
    }

    #[test]
    fn test_primitive_limit_enforced() {
        let registry = Arc::new(EntryRegistry::new());
        let table = Arc::new(LockTable::new());
        let root = registry.root();
        let (file, _) = registry.ensure(root, "f", EntryKind::File).unwrap();
        let arbiter = OperationArbiter::new(
            registry,
            table,
            Arc::new(AllowAll),
            CoreLimits {
                max_open_primitives: 1,
                ..CoreLimits::default()
            },
        );

        arbiter.open_handle(CTX, file, HandleMode::ReadOnly).unwrap();
        assert!(matches!(
            arbiter.open_handle(CTX, file, HandleMode::ReadOnly),
            Err(CoreError::TooManyOpenPrimitives)
        ));
    }

    #[test]
    fn test_waker_after_release_allows_rerequest() {
        let (_registry, arbiter, _dir, file) = setup();
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let rec = arbiter.open_handle(CTX, file, HandleMode::ReadWrite).unwrap();
        let woken = StdArc::new(AtomicBool::new(false));
        let woken_clone = woken.clone();
        arbiter.on_entry_free(
            file,
            Box::new(move || {
                woken_clone.store(true, Ordering::SeqCst);
            }),
        );

        arbiter.close_primitive(&rec);
        assert!(woken.load(Ordering::SeqCst));
        // No auto-admission: the caller re-requests.
        assert!(arbiter.open_handle(CTX, file, HandleMode::ReadWrite).is_ok());
    }
}
