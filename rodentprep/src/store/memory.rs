//! In-memory artifact store.

use super::{ArtifactStore, CacheEntry, CommitOutcome};
use crate::errors::StoreError;
use crate::steps::Fingerprint;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Artifact store that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: DashMap<Fingerprint, CacheEntry>,
}

impl InMemoryArtifactStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy of the entry for `fingerprint`, without going through
    /// the async interface.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.get(fingerprint).map(|e| e.value().clone())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.get(fingerprint))
    }

    async fn commit(&self, entry: CacheEntry) -> Result<CommitOutcome, StoreError> {
        match self.entries.entry(entry.fingerprint.clone()) {
            Entry::Occupied(existing) => Ok(CommitOutcome::AlreadyCommitted(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(CommitOutcome::Committed)
            }
        }
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.entries.remove(fingerprint).is_some())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut all: Vec<CacheEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(all)
    }
}
