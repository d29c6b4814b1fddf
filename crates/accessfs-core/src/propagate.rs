// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ancestor marker propagation for AccessFS Core

use std::sync::Arc;

use crate::error::CoreResult;
use crate::lock_table::LockTable;
use crate::registry::EntryRegistry;
use crate::types::EntryId;

/// Walks an entry's ancestor chain and maintains the "descendant locked"
/// reference counts that block ancestor moves and removals.
///
/// A held lock pins its own entry (moves need zero active records) and
/// every marked ancestor (moves need zero markers), so the chain at
/// release time is the chain at acquisition time and can be recomputed.
pub(crate) struct PathLockPropagator {
    registry: Arc<EntryRegistry>,
    table: Arc<LockTable>,
}

impl PathLockPropagator {
    pub fn new(registry: Arc<EntryRegistry>, table: Arc<LockTable>) -> Self {
        Self { registry, table }
    }

    /// Increment the marker on each ancestor, immediate parent to root
    pub fn mark_ancestors(&self, entry: EntryId) -> CoreResult<()> {
        for ancestor in self.registry.ancestors_of(entry)? {
            self.table.add_marker(ancestor);
        }
        Ok(())
    }

    /// Mirror of `mark_ancestors`; underflow panics in the table
    pub fn unmark_ancestors(&self, entry: EntryId) -> CoreResult<()> {
        for ancestor in self.registry.ancestors_of(entry)? {
            self.table.remove_marker(ancestor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;

    #[test]
    fn test_mark_and_unmark_full_chain() {
        let registry = Arc::new(EntryRegistry::new());
        let table = Arc::new(LockTable::new());
        let root = registry.root();
        let (a, _) = registry.ensure(root, "a", EntryKind::Directory).unwrap();
        let (b, _) = registry.ensure(a, "b", EntryKind::Directory).unwrap();
        let (file, _) = registry.ensure(b, "f", EntryKind::File).unwrap();

        let propagator = PathLockPropagator::new(registry, table.clone());
        propagator.mark_ancestors(file).unwrap();

        assert_eq!(table.marker_count(b), 1);
        assert_eq!(table.marker_count(a), 1);
        assert_eq!(table.marker_count(root), 1);
        assert_eq!(table.marker_count(file), 0);

        propagator.unmark_ancestors(file).unwrap();
        assert_eq!(table.marker_count(b), 0);
        assert_eq!(table.marker_count(a), 0);
        assert_eq!(table.marker_count(root), 0);
    }

    #[test]
    fn test_overlapping_chains_accumulate() {
        let registry = Arc::new(EntryRegistry::new());
        let table = Arc::new(LockTable::new());
        let root = registry.root();
        let (dir, _) = registry.ensure(root, "dir", EntryKind::Directory).unwrap();
        let (x, _) = registry.ensure(dir, "x", EntryKind::File).unwrap();
        let (y, _) = registry.ensure(dir, "y", EntryKind::File).unwrap();

        let propagator = PathLockPropagator::new(registry, table.clone());
        propagator.mark_ancestors(x).unwrap();
        propagator.mark_ancestors(y).unwrap();

        assert_eq!(table.marker_count(dir), 2);
        assert_eq!(table.marker_count(root), 2);

        propagator.unmark_ancestors(x).unwrap();
        assert_eq!(table.marker_count(dir), 1);
        propagator.unmark_ancestors(y).unwrap();
        assert_eq!(table.marker_count(dir), 0);
    }
}
