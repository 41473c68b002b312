//! Transaction disciplines for the main processing step.
//!
//! The main step writes to both the relational store and the file store.
//! [`XaTransactionStrategy`] commits them in two phases;
//! [`LocalTransactionStrategy`] commits two independent local transactions
//! and rolls both back on failure. The strategy is chosen once from
//! configuration and injected into each dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{DatabaseError, Error, Result};
use crate::filestore::{FileStoreClient, FileTransaction};
use crate::store::{PipelineStore, StoreTransaction};

/// Open transactions against both resource managers.
pub struct MainTransaction {
    pub store: Box<dyn StoreTransaction>,
    pub files: FileTransaction,
}

/// begin/commit/rollback over a [`MainTransaction`].
#[async_trait]
pub trait TransactionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn begin(&self) -> Result<MainTransaction>;

    async fn commit(&self, tx: MainTransaction) -> Result<()>;

    async fn rollback(&self, tx: MainTransaction) -> Result<()>;
}

/// Build the strategy selected by configuration.
pub fn strategy_for(
    use_xa: bool,
    store: Arc<dyn PipelineStore>,
    files: Arc<dyn FileStoreClient>,
) -> Arc<dyn TransactionStrategy> {
    if use_xa {
        Arc::new(XaTransactionStrategy::new(store, files))
    } else {
        Arc::new(LocalTransactionStrategy::new(store, files))
    }
}

async fn begin_both(
    store: &dyn PipelineStore,
    files: &dyn FileStoreClient,
) -> Result<MainTransaction> {
    let store_tx = store.begin().await?;
    let files_tx = files.begin_local_transaction().await?;
    Ok(MainTransaction {
        store: store_tx,
        files: files_tx,
    })
}

/// Roll back both sides, reporting the first failure.
async fn rollback_both(files: &dyn FileStoreClient, tx: MainTransaction) -> Result<()> {
    let store_result = tx.store.rollback().await;
    let files_result = files.rollback_local_transaction_if_active(tx.files).await;
    store_result?;
    files_result?;
    Ok(())
}

// ── Two-phase ───────────────────────────────────────────────────────────

/// Prepare the file store, commit the database, then commit the files.
pub struct XaTransactionStrategy {
    store: Arc<dyn PipelineStore>,
    files: Arc<dyn FileStoreClient>,
}

impl XaTransactionStrategy {
    pub fn new(store: Arc<dyn PipelineStore>, files: Arc<dyn FileStoreClient>) -> Self {
        Self { store, files }
    }
}

#[async_trait]
impl TransactionStrategy for XaTransactionStrategy {
    fn name(&self) -> &'static str {
        "xa"
    }

    async fn begin(&self) -> Result<MainTransaction> {
        begin_both(self.store.as_ref(), self.files.as_ref()).await
    }

    async fn commit(&self, tx: MainTransaction) -> Result<()> {
        if let Err(e) = self.files.prepare(&tx.files).await {
            rollback_both(self.files.as_ref(), tx).await.ok();
            return Err(e.into());
        }

        let MainTransaction { store, files } = tx;
        if let Err(e) = store.commit().await {
            self.files
                .rollback_local_transaction_if_active(files)
                .await
                .ok();
            return Err(e.into());
        }

        self.files.commit_local_transaction(files).await.map_err(|e| {
            // Database side is already durable
            error!(error = %e, "File store commit failed after database commit");
            Error::from(e)
        })?;
        debug!("Two-phase commit complete");
        Ok(())
    }

    async fn rollback(&self, tx: MainTransaction) -> Result<()> {
        rollback_both(self.files.as_ref(), tx).await
    }
}

// ── Local pair ──────────────────────────────────────────────────────────

/// Commit the file store, then the database, as independent transactions.
pub struct LocalTransactionStrategy {
    store: Arc<dyn PipelineStore>,
    files: Arc<dyn FileStoreClient>,
}

impl LocalTransactionStrategy {
    pub fn new(store: Arc<dyn PipelineStore>, files: Arc<dyn FileStoreClient>) -> Self {
        Self { store, files }
    }
}

#[async_trait]
impl TransactionStrategy for LocalTransactionStrategy {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn begin(&self) -> Result<MainTransaction> {
        begin_both(self.store.as_ref(), self.files.as_ref()).await
    }

    async fn commit(&self, tx: MainTransaction) -> Result<()> {
        let MainTransaction { store, files } = tx;
        if let Err(e) = self.files.commit_local_transaction(files).await {
            store.rollback().await.ok();
            return Err(e.into());
        }
        store.commit().await.map_err(|e: DatabaseError| {
            error!(error = %e, "Database commit failed after file store commit");
            Error::from(e)
        })
    }

    async fn rollback(&self, tx: MainTransaction) -> Result<()> {
        rollback_both(self.files.as_ref(), tx).await
    }
}
