//! File store client used for module-produced artifacts.
//!
//! - `local` — directory-backed store with staged, atomically committed writes
//! - `retry` — backoff policy for reaching the store

pub mod local;
pub mod retry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::FileStoreError;

pub use local::LocalFileStore;
pub use retry::{RetryPolicy, ensure_connected};

/// Client for the shared file store.
#[async_trait]
pub trait FileStoreClient: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), FileStoreError>;

    /// Re-establish a stale connection.
    async fn reconnect(&self) -> Result<(), FileStoreError>;

    /// Open a transaction; writes through it stay invisible until commit.
    async fn begin_local_transaction(&self) -> Result<FileTransaction, FileStoreError>;

    /// First phase of a two-phase commit: make the staged writes durable.
    async fn prepare(&self, tx: &FileTransaction) -> Result<(), FileStoreError>;

    async fn commit_local_transaction(&self, tx: FileTransaction) -> Result<(), FileStoreError>;

    /// Discard staged writes. A no-op for an already finished transaction.
    async fn rollback_local_transaction_if_active(
        &self,
        tx: FileTransaction,
    ) -> Result<(), FileStoreError>;

    /// Settle transactions this client left behind in an earlier run:
    /// finish the ones whose commit had started, discard the rest.
    async fn recover_abandoned(&self) -> Result<StagingRecovery, FileStoreError>;

    /// Read a committed file.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, FileStoreError>;
}

/// Outcome of [`FileStoreClient::recover_abandoned`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingRecovery {
    pub rolled_forward: usize,
    pub discarded: usize,
}

/// Handle to an open file-store transaction.
#[derive(Debug)]
pub struct FileTransaction {
    id: Uuid,
    staging_dir: PathBuf,
}

impl FileTransaction {
    pub(crate) fn new(id: Uuid, staging_dir: PathBuf) -> Self {
        Self { id, staging_dir }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Stage a file to be published when the transaction commits.
    pub async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<(), FileStoreError> {
        validate_name(name)?;
        tokio::fs::write(self.staging_dir.join(name), contents.as_ref()).await?;
        Ok(())
    }
}

/// File names are flat: no separators, no parent references.
pub(crate) fn validate_name(name: &str) -> Result<(), FileStoreError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(FileStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
