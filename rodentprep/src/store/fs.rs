//! Artifact store persisted under the working directory.
//!
//! Layout: `<root>/<fp[0..2]>/<fp>.json`. An entry is first written to a
//! uniquely named temp file in the same directory, then hard-linked to its
//! final name. `link` fails with `AlreadyExists` when another writer got
//! there first, which makes first-committer-wins a property of the
//! filesystem rather than of any in-process lock.

use super::{ArtifactStore, CacheEntry, CommitOutcome};
use crate::errors::StoreError;
use crate::steps::Fingerprint;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Artifact store backed by JSON files.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;
        debug!(root = %root.display(), "Opened artifact store");
        Ok(Self { root })
    }

    /// Opens the store inside a working directory (`<work_dir>/cache`).
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub async fn in_work_dir(work_dir: &Path) -> Result<Self, StoreError> {
        Self::open(work_dir.join("cache")).await
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns where the entry for `fingerprint` lives.
    #[must_use]
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.as_str();
        let shard = &hex[..hex.len().min(2)];
        self.root.join(shard).join(format!("{hex}.json"))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, StoreError> {
        Self::read_entry(&self.entry_path(fingerprint)).await
    }

    async fn commit(&self, entry: CacheEntry) -> Result<CommitOutcome, StoreError> {
        let path = self.entry_path(&entry.fingerprint);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let tmp = dir.join(format!(".{}.{}.tmp", entry.fingerprint, uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(&entry)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %e, "Failed to remove temp entry");
        }

        match linked {
            Ok(()) => Ok(CommitOutcome::Committed),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(fingerprint = %entry.fingerprint.short(), "Entry already committed");
                let existing = Self::read_entry(&path)
                    .await?
                    .ok_or_else(|| StoreError::io(&path, e))?;
                Ok(CommitOutcome::AlreadyCommitted(existing))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let path = self.entry_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut all = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(&shard_path)
                .await
                .map_err(|e| StoreError::io(&shard_path, e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&shard_path, e))?
            {
                let path = file.path();
                let is_entry = path.extension().is_some_and(|ext| ext == "json")
                    && !file.file_name().to_string_lossy().starts_with('.');
                if is_entry {
                    if let Some(entry) = Self::read_entry(&path).await? {
                        all.push(entry);
                    }
                }
            }
        }

        all.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactMap, ArtifactValue};
    use crate::errors::{MissingOutputError, StepError};
    use std::sync::Arc;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::in_work_dir(dir.path()).await.unwrap();
        assert_eq!(store.root(), dir.path().join("cache"));

        let mut outputs = ArtifactMap::new();
        outputs.insert("brain".to_string(), ArtifactValue::File(dir.path().join("brain.nii.gz")));
        let entry = CacheEntry::success(fp("abcdef"), "brain_extraction", outputs);

        assert!(store.commit(entry.clone()).await.unwrap().is_committed());
        assert!(store.entry_path(&fp("abcdef")).ends_with("ab/abcdef.json"));

        let found = store.lookup(&fp("abcdef")).await.unwrap().unwrap();
        assert_eq!(found, entry);
    }

    #[tokio::test]
    async fn test_fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsArtifactStore::in_work_dir(dir.path()).await.unwrap();
            store
                .commit(CacheEntry::success(fp("1234"), "anat", ArtifactMap::new()))
                .await
                .unwrap();
        }

        let reopened = FsArtifactStore::in_work_dir(dir.path()).await.unwrap();
        assert!(reopened.lookup(&fp("1234")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fs_store_first_committer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::in_work_dir(dir.path()).await.unwrap();
        let failure = StepError::MissingOutput(MissingOutputError {
            step: "anat".to_string(),
            artifact: "brain".to_string(),
            path: None,
        });

        store.commit(CacheEntry::failed(fp("ff00"), "anat", failure)).await.unwrap();
        let second = store
            .commit(CacheEntry::success(fp("ff00"), "anat", ArtifactMap::new()))
            .await
            .unwrap();

        assert!(matches!(second, CommitOutcome::AlreadyCommitted(ref e) if !e.is_success()));
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_concurrent_commits_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::in_work_dir(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .commit(CacheEntry::success(fp("beef"), format!("writer{i}"), ArtifactMap::new()))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_committed() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::in_work_dir(dir.path()).await.unwrap();
        store.commit(CacheEntry::success(fp("0a0a"), "x", ArtifactMap::new())).await.unwrap();

        assert!(store.invalidate(&fp("0a0a")).await.unwrap());
        assert!(!store.invalidate(&fp("0a0a")).await.unwrap());
        assert!(store.lookup(&fp("0a0a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_corrupt_entry_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::in_work_dir(dir.path()).await.unwrap();
        let path = store.entry_path(&fp("dead"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            store.lookup(&fp("dead")).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
