//! Cache of open file metadata
//!
//! Entries are loaded lazily from the storage layout on first access and
//! removed explicitly when the last handle on a file is closed. There is no
//! eviction: an absent entry means the file is not open.

use super::FileMetadata;
use std::collections::HashMap;
use stripestore_common::{FileId, Result};
use tracing::debug;

/// Open file metadata owned by one storage thread
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: HashMap<FileId, FileMetadata>,
    loads: u64,
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get cached metadata
    #[must_use]
    pub fn get(&self, file_id: &FileId) -> Option<&FileMetadata> {
        self.entries.get(file_id)
    }

    /// Get cached metadata for mutation
    pub fn get_mut(&mut self, file_id: &FileId) -> Option<&mut FileMetadata> {
        self.entries.get_mut(file_id)
    }

    /// Get cached metadata, loading it on a miss
    ///
    /// A failed load leaves the cache unchanged.
    pub fn get_or_load<F>(&mut self, file_id: &FileId, load: F) -> Result<&mut FileMetadata>
    where
        F: FnOnce() -> Result<FileMetadata>,
    {
        if !self.entries.contains_key(file_id) {
            let md = load()?;
            self.loads += 1;
            debug!("loaded metadata for {}", file_id);
            self.entries.insert(file_id.clone(), md);
        }
        self.entries
            .get_mut(file_id)
            .ok_or_else(|| stripestore_common::Error::internal("metadata vanished after load"))
    }

    /// Insert or replace metadata
    pub fn insert(&mut self, file_id: FileId, md: FileMetadata) {
        self.entries.insert(file_id, md);
    }

    /// Remove a file's metadata
    pub fn remove(&mut self, file_id: &FileId) -> Option<FileMetadata> {
        let removed = self.entries.remove(file_id);
        if removed.is_some() {
            debug!("flushed metadata for {}", file_id);
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, file_id: &FileId) -> bool {
        self.entries.contains_key(file_id)
    }

    /// Ids of all open files
    pub fn file_ids(&self) -> impl Iterator<Item = &FileId> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of loads from disk since creation
    #[must_use]
    pub const fn loads(&self) -> u64 {
        self.loads
    }
}
