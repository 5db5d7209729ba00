//! Content-addressed artifact store.
//!
//! The store maps a step fingerprint to the outcome of running that step.
//! Entries are immutable once published: the first committer wins and every
//! later commit for the same fingerprint is a no-op that returns the
//! authoritative entry. Stores are explicit objects shared through an
//! `Arc`; tests create one per case.

mod entry;
mod fs;
mod memory;

pub use entry::{CacheEntry, CacheStatus, CommitOutcome};
pub use fs::FsArtifactStore;
pub use memory::InMemoryArtifactStore;

use crate::errors::StoreError;
use crate::steps::Fingerprint;
use async_trait::async_trait;

/// Protocol for artifact store backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// Gets the entry for a fingerprint.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, StoreError>;

    /// Publishes an entry atomically. The first committer wins.
    async fn commit(&self, entry: CacheEntry) -> Result<CommitOutcome, StoreError>;

    /// Removes an entry. Returns true if one existed.
    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Lists every entry.
    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError>;
}
