// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Byte store implementations for AccessFS Core

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::types::ContentId;

/// Byte-level storage collaborator.
///
/// The core never interprets content; it only moves bytes on behalf of a
/// lock-holding primitive. `clone_content` backs writable-stream swap
/// files: a stream writes into a clone and the core commits the clone on
/// close or discards it on abort.
pub trait ByteStore: Send + Sync {
    fn allocate(&self, initial: &[u8]) -> CoreResult<ContentId>;
    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> CoreResult<usize>;
    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> CoreResult<usize>;
    fn truncate(&self, id: ContentId, new_len: u64) -> CoreResult<()>;
    fn len(&self, id: ContentId) -> CoreResult<u64>;
    fn clone_content(&self, base: ContentId) -> CoreResult<ContentId>;
    fn discard(&self, id: ContentId) -> CoreResult<()>;
}

/// In-memory byte store implementation
pub struct InMemoryByteStore {
    next_id: Mutex<u64>,
    data: Mutex<HashMap<ContentId, Vec<u8>>>,
}

impl InMemoryByteStore {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            data: Mutex::new(HashMap::new()),
        }
    }

    fn get_next_id(&self) -> ContentId {
        let mut next_id = self.next_id.lock().unwrap();
        let id = ContentId::new(*next_id);
        *next_id += 1;
        id
    }
}

impl ByteStore for InMemoryByteStore {
    fn allocate(&self, initial: &[u8]) -> CoreResult<ContentId> {
        let id = self.get_next_id();
        let mut data = self.data.lock().unwrap();
        data.insert(id, initial.to_vec());
        Ok(id)
    }

    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> CoreResult<usize> {
        let data = self.data.lock().unwrap();
        let content = data.get(&id).ok_or(CoreError::NotFound)?;

        let start = offset as usize;
        if start >= content.len() {
            return Ok(0);
        }

        let end = std::cmp::min(start + buf.len(), content.len());
        let bytes_to_copy = end - start;
        buf[..bytes_to_copy].copy_from_slice(&content[start..end]);
        Ok(bytes_to_copy)
    }

    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> CoreResult<usize> {
        let mut store_data = self.data.lock().unwrap();
        let content = store_data.get_mut(&id).ok_or(CoreError::NotFound)?;

        let start = offset as usize;
        let end = start + data.len();

        if end > content.len() {
            content.resize(end, 0);
        }

        content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> CoreResult<()> {
        let mut data = self.data.lock().unwrap();
        let content = data.get_mut(&id).ok_or(CoreError::NotFound)?;
        content.resize(new_len as usize, 0);
        Ok(())
    }

    fn len(&self, id: ContentId) -> CoreResult<u64> {
        let data = self.data.lock().unwrap();
        let content = data.get(&id).ok_or(CoreError::NotFound)?;
        Ok(content.len() as u64)
    }

    fn clone_content(&self, base: ContentId) -> CoreResult<ContentId> {
        let base_content = {
            let data = self.data.lock().unwrap();
            data.get(&base).ok_or(CoreError::NotFound)?.clone()
        };
        let id = self.get_next_id();
        let mut data = self.data.lock().unwrap();
        data.insert(id, base_content);
        Ok(id)
    }

    fn discard(&self, id: ContentId) -> CoreResult<()> {
        let mut data = self.data.lock().unwrap();
        data.remove(&id);
        Ok(())
    }
}

impl Default for InMemoryByteStore {
    fn default() -> Self {
        Self::new()
    }
}
