//! Directory-backed file store.
//!
//! Committed files live under `{root}/data`. Each transaction stages its
//! writes in `{root}/staging/{owner}/{id}`; commit renames them into place
//! and removes the staging directory. The owner is the worker host, so a
//! store shared between hosts only ever sweeps its own leftovers.
//!
//! Prepare drops a marker once the staged files are synced, and commit drops
//! another before the first rename. After a crash a staging directory holding
//! either marker is rolled forward: once prepared, the store commit may
//! already have happened. Any other leftover is discarded.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::FileStoreError;
use crate::filestore::{FileStoreClient, FileTransaction, StagingRecovery, validate_name};

const PREPARED_MARKER: &str = ".prepared";
const COMMITTED_MARKER: &str = ".committed";

/// Staging owner used by [`LocalFileStore::open`].
const DEFAULT_OWNER: &str = "local";

/// File store rooted at a local (or network-mounted) directory.
pub struct LocalFileStore {
    root: PathBuf,
    owner: String,
}

impl LocalFileStore {
    /// Open the store, creating its directories if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        Self::open_for_host(root, DEFAULT_OWNER).await
    }

    /// Open the store with staging scoped to `host`.
    pub async fn open_for_host(
        root: impl Into<PathBuf>,
        host: &str,
    ) -> Result<Self, FileStoreError> {
        let owner: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let store = Self {
            root: root.into(),
            owner: if owner.is_empty() { DEFAULT_OWNER.to_string() } else { owner },
        };
        store.create_layout().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Parent of this owner's per-transaction staging directories.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging").join(&self.owner)
    }

    async fn create_layout(&self) -> Result<(), FileStoreError> {
        tokio::fs::create_dir_all(self.data_dir()).await?;
        tokio::fs::create_dir_all(self.staging_dir()).await?;
        Ok(())
    }

    async fn staged_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, FileStoreError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == PREPARED_MARKER || name == COMMITTED_MARKER {
                continue;
            }
            files.push((name, entry.path()));
        }
        Ok(files)
    }

    /// Move every staged file into place and drop the staging directory.
    async fn publish(&self, dir: &Path) -> Result<usize, FileStoreError> {
        let files = Self::staged_files(dir).await?;
        let count = files.len();
        for (name, path) in files {
            tokio::fs::rename(&path, self.data_dir().join(&name)).await?;
        }
        tokio::fs::remove_dir_all(dir).await?;
        Ok(count)
    }
}

#[async_trait]
impl FileStoreClient for LocalFileStore {
    async fn ping(&self) -> Result<(), FileStoreError> {
        match tokio::fs::metadata(self.data_dir()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(FileStoreError::Unavailable(format!(
                "{} is not a directory",
                self.data_dir().display()
            ))),
            Err(e) => Err(FileStoreError::Unavailable(format!(
                "{}: {e}",
                self.data_dir().display()
            ))),
        }
    }

    async fn reconnect(&self) -> Result<(), FileStoreError> {
        self.create_layout()
            .await
            .map_err(|e| FileStoreError::Unavailable(e.to_string()))
    }

    async fn begin_local_transaction(&self) -> Result<FileTransaction, FileStoreError> {
        let id = Uuid::new_v4();
        let staging = self.staging_dir().join(id.to_string());
        tokio::fs::create_dir_all(&staging).await?;
        debug!(tx = %id, "File transaction started");
        Ok(FileTransaction::new(id, staging))
    }

    async fn prepare(&self, tx: &FileTransaction) -> Result<(), FileStoreError> {
        let dir = tx.staging_dir();
        if !tokio::fs::try_exists(dir).await? {
            return Err(FileStoreError::NoActiveTransaction {
                id: tx.id().to_string(),
            });
        }
        for (_, path) in Self::staged_files(dir).await? {
            tokio::fs::File::open(&path).await?.sync_all().await?;
        }
        tokio::fs::write(dir.join(PREPARED_MARKER), b"").await?;
        Ok(())
    }

    async fn commit_local_transaction(&self, tx: FileTransaction) -> Result<(), FileStoreError> {
        let dir = tx.staging_dir();
        if !tokio::fs::try_exists(dir).await? {
            return Err(FileStoreError::NoActiveTransaction {
                id: tx.id().to_string(),
            });
        }
        tokio::fs::write(dir.join(COMMITTED_MARKER), b"").await?;
        let count = self.publish(dir).await?;
        debug!(tx = %tx.id(), files = count, "File transaction committed");
        Ok(())
    }

    async fn rollback_local_transaction_if_active(
        &self,
        tx: FileTransaction,
    ) -> Result<(), FileStoreError> {
        let dir = tx.staging_dir();
        if tokio::fs::try_exists(dir).await? {
            tokio::fs::remove_dir_all(dir).await?;
            debug!(tx = %tx.id(), "File transaction rolled back");
        }
        Ok(())
    }

    async fn recover_abandoned(&self) -> Result<StagingRecovery, FileStoreError> {
        let mut recovery = StagingRecovery::default();
        let mut entries = tokio::fs::read_dir(self.staging_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let committed = tokio::fs::try_exists(dir.join(COMMITTED_MARKER)).await?;
            let prepared = tokio::fs::try_exists(dir.join(PREPARED_MARKER)).await?;
            if committed || prepared {
                let files = self.publish(&dir).await?;
                warn!(staging = %dir.display(), files, committed, "Finished interrupted file commit");
                recovery.rolled_forward += 1;
            } else {
                tokio::fs::remove_dir_all(&dir).await?;
                warn!(staging = %dir.display(), "Discarded abandoned file transaction");
                recovery.discarded += 1;
            }
        }
        Ok(recovery)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
        validate_name(name)?;
        match tokio::fs::read(self.data_dir().join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
