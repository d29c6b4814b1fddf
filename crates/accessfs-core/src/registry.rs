// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Entry identity and tree structure for AccessFS Core
//!
//! The registry is an arena of entries with explicit parent indices, never
//! parent pointers. Identity is stable across renames; ancestor and path
//! lookups always reflect the current tree.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::types::{EntryId, EntryKind};

struct EntryMeta {
    parent: Option<EntryId>,
    name: String,
    kind: EntryKind,
    children: HashMap<String, EntryId>,
}

struct RegistryState {
    entries: HashMap<EntryId, EntryMeta>,
    root: EntryId,
    next_id: u64,
}

/// Arena of file-system entries with parent-index lookups
pub struct EntryRegistry {
    state: Mutex<RegistryState>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        let root = EntryId::new(1);
        let mut entries = HashMap::new();
        entries.insert(
            root,
            EntryMeta {
                parent: None,
                name: String::new(),
                kind: EntryKind::Directory,
                children: HashMap::new(),
            },
        );
        Self {
            state: Mutex::new(RegistryState {
                entries,
                root,
                next_id: 2,
            }),
        }
    }

    pub fn root(&self) -> EntryId {
        self.state.lock().unwrap().root
    }

    /// Resolve an absolute path to an entry identity
    pub fn resolve(&self, path: &Path) -> CoreResult<EntryId> {
        let state = self.state.lock().unwrap();
        let mut current = state.root;
        for component in path.components() {
            let name = match component {
                std::path::Component::RootDir => continue,
                std::path::Component::Normal(n) => {
                    n.to_str().ok_or(CoreError::InvalidName)?
                }
                _ => return Err(CoreError::NotFound),
            };
            let meta = state.entries.get(&current).ok_or(CoreError::NotFound)?;
            current = *meta.children.get(name).ok_or(CoreError::NotFound)?;
        }
        Ok(current)
    }

    /// Ancestors of an entry, immediate parent first, root last
    pub fn ancestors_of(&self, id: EntryId) -> CoreResult<Vec<EntryId>> {
        let state = self.state.lock().unwrap();
        let mut meta = state.entries.get(&id).ok_or(CoreError::NotFound)?;
        let mut ancestors = Vec::new();
        while let Some(parent) = meta.parent {
            ancestors.push(parent);
            meta = state.entries.get(&parent).ok_or(CoreError::NotFound)?;
        }
        Ok(ancestors)
    }

    /// Path components of an entry from the tree root (empty for the root)
    pub fn path_of(&self, id: EntryId) -> CoreResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut meta = state.entries.get(&id).ok_or(CoreError::NotFound)?;
        let mut components = Vec::new();
        while let Some(parent) = meta.parent {
            components.push(meta.name.clone());
            meta = state.entries.get(&parent).ok_or(CoreError::NotFound)?;
        }
        components.reverse();
        Ok(components)
    }

    pub fn kind_of(&self, id: EntryId) -> CoreResult<EntryKind> {
        let state = self.state.lock().unwrap();
        state.entries.get(&id).map(|m| m.kind).ok_or(CoreError::NotFound)
    }

    pub fn child_of(&self, dir: EntryId, name: &str) -> CoreResult<Option<EntryId>> {
        let state = self.state.lock().unwrap();
        let meta = state.entries.get(&dir).ok_or(CoreError::NotFound)?;
        if meta.kind != EntryKind::Directory {
            return Err(CoreError::NotSupported);
        }
        Ok(meta.children.get(name).copied())
    }

    pub fn has_children(&self, dir: EntryId) -> CoreResult<bool> {
        let state = self.state.lock().unwrap();
        let meta = state.entries.get(&dir).ok_or(CoreError::NotFound)?;
        Ok(!meta.children.is_empty())
    }

    /// True if `maybe_ancestor` lies on the parent chain of `id` (or is `id`)
    pub fn is_ancestor_or_self(&self, maybe_ancestor: EntryId, id: EntryId) -> bool {
        let state = self.state.lock().unwrap();
        let mut current = Some(id);
        while let Some(c) = current {
            if c == maybe_ancestor {
                return true;
            }
            current = state.entries.get(&c).and_then(|m| m.parent);
        }
        false
    }

    /// Get-or-create a child entry. Returns the id and whether it was
    /// created; an existing entry of a different kind is `NotSupported`.
    pub fn ensure(
        &self,
        parent: EntryId,
        name: &str,
        kind: EntryKind,
    ) -> CoreResult<(EntryId, bool)> {
        let mut state = self.state.lock().unwrap();
        let parent_meta = state.entries.get(&parent).ok_or(CoreError::NotFound)?;
        if parent_meta.kind != EntryKind::Directory {
            return Err(CoreError::NotSupported);
        }
        if let Some(existing) = parent_meta.children.get(name).copied() {
            let existing_kind =
                state.entries.get(&existing).ok_or(CoreError::NotFound)?.kind;
            if existing_kind != kind {
                return Err(CoreError::NotSupported);
            }
            return Ok((existing, false));
        }

        let id = EntryId::new(state.next_id);
        state.next_id += 1;
        state.entries.insert(
            id,
            EntryMeta {
                parent: Some(parent),
                name: name.to_string(),
                kind,
                children: HashMap::new(),
            },
        );
        state
            .entries
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .insert(name.to_string(), id);
        Ok((id, true))
    }

    /// Remove an entry and everything beneath it; returns the removed ids
    /// (the entry itself included).
    pub fn remove_subtree(&self, id: EntryId) -> CoreResult<Vec<EntryId>> {
        let mut state = self.state.lock().unwrap();
        if id == state.root {
            return Err(CoreError::NotSupported);
        }
        let meta = state.entries.get(&id).ok_or(CoreError::NotFound)?;
        let parent = meta.parent;
        let name = meta.name.clone();

        let mut removed = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(meta) = state.entries.remove(&current) {
                pending.extend(meta.children.values().copied());
                removed.push(current);
            }
        }
        if let Some(parent) = parent {
            if let Some(parent_meta) = state.entries.get_mut(&parent) {
                parent_meta.children.remove(&name);
            }
        }
        Ok(removed)
    }

    /// Relink an entry under a new parent with a new name. The destination
    /// name must be free; the caller resolves overwrites beforehand.
    pub fn reparent(
        &self,
        id: EntryId,
        new_parent: EntryId,
        new_name: &str,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if id == state.root {
            return Err(CoreError::NotSupported);
        }
        let parent_meta = state.entries.get(&new_parent).ok_or(CoreError::NotFound)?;
        if parent_meta.kind != EntryKind::Directory {
            return Err(CoreError::NotSupported);
        }
        if parent_meta.children.contains_key(new_name) {
            return Err(CoreError::NotSupported);
        }

        // Reparenting under the entry's own subtree would orphan it.
        let mut current = Some(new_parent);
        while let Some(c) = current {
            if c == id {
                return Err(CoreError::NoModificationAllowed);
            }
            current = state.entries.get(&c).and_then(|m| m.parent);
        }

        let meta = state.entries.get_mut(&id).ok_or(CoreError::NotFound)?;
        let old_parent = meta.parent;
        let old_name = std::mem::replace(&mut meta.name, new_name.to_string());
        meta.parent = Some(new_parent);

        if let Some(old_parent) = old_parent {
            if let Some(old_meta) = state.entries.get_mut(&old_parent) {
                old_meta.children.remove(&old_name);
            }
        }
        state
            .entries
            .get_mut(&new_parent)
            .expect("parent checked above")
            .children
            .insert(new_name.to_string(), id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EntryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate an entry name against platform-neutral constraints
pub fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::InvalidName);
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(CoreError::InvalidName);
    }
    Ok(())
}
