//! Worker process: startup recovery, then a fixed group of listeners.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{HOST_OVERRIDES_PATH, HostOverrides, WorkerConfig};
use crate::error::Result;
use crate::filestore::StagingRecovery;
use crate::messaging::PriorityQueuePool;
use crate::worker::context::ThreadContextRegistry;
use crate::worker::dispatcher::{DispatcherDeps, DispatcherSettings, WorkerTaskDispatcher};
use crate::worker::listener::TaskRequestListener;
use crate::worker::recovery::{ClearStaleStateResults, recover, resubmit_waiting_tasks};

/// Running worker threads of this process.
pub struct WorkerProcess {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    contexts: Arc<ThreadContextRegistry>,
    recovered: ClearStaleStateResults,
    staging: StagingRecovery,
    resubmitted: usize,
}

impl WorkerProcess {
    /// Recover stale state for this host and start the listeners. The thread
    /// count honours the per-host overrides file.
    pub async fn start(config: &WorkerConfig, deps: DispatcherDeps) -> Result<Self> {
        let overrides = HostOverrides::load(HOST_OVERRIDES_PATH)?;
        Self::start_with_overrides(config, &overrides, deps).await
    }

    pub async fn start_with_overrides(
        config: &WorkerConfig,
        overrides: &HostOverrides,
        deps: DispatcherDeps,
    ) -> Result<Self> {
        let staging = deps.file_store.recover_abandoned().await?;

        let pool = Arc::new(PriorityQueuePool::new(Arc::clone(&deps.broker)));
        let reclaimed = deps.broker.recover_in_flight(pool.queue_names()).await?;
        let recovered = recover(deps.store.as_ref(), &deps.executor, &config.host).await?;

        // Requests reclaimed from a dead consumer come back as redeliveries and
        // get discarded, so the tasks still waiting on them need a fresh one.
        // A broker that forgets everything on restart has lost all of them.
        let only = if !deps.broker.is_durable()
            && deps.broker.pending(pool.queue_names()).await? == 0
        {
            None
        } else {
            Some(reclaimed.iter().map(|r| r.task_id).collect::<HashSet<_>>())
        };
        let resubmitted = match &only {
            Some(ids) if ids.is_empty() => 0,
            only => {
                resubmit_waiting_tasks(deps.store.as_ref(), &deps.executor, only.as_ref()).await?
            }
        };

        let threads = config.resolve_worker_threads(overrides);
        let contexts = Arc::clone(&deps.contexts);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(threads);
        for thread in 0..threads {
            let dispatcher = WorkerTaskDispatcher::new(
                thread as u32,
                deps.clone(),
                DispatcherSettings::from(config),
            );
            let listener = TaskRequestListener::new(
                Arc::clone(&pool),
                dispatcher,
                config.poll_interval,
                config.error_pause,
            );
            joins.push(tokio::spawn(listener.run(shutdown_rx.clone())));
        }

        info!(
            host = %config.host,
            threads,
            use_xa = config.use_xa,
            staging_rolled_forward = staging.rolled_forward,
            staging_discarded = staging.discarded,
            resubmitted,
            "Worker process started"
        );
        Ok(Self {
            shutdown_tx,
            joins,
            contexts,
            recovered,
            staging,
            resubmitted,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.joins.len()
    }

    /// Published per-thread snapshots.
    pub fn registry(&self) -> Arc<ThreadContextRegistry> {
        Arc::clone(&self.contexts)
    }

    /// What startup recovery repaired.
    pub fn recovered(&self) -> &ClearStaleStateResults {
        &self.recovered
    }

    /// What the file store did with staging left by a previous process.
    pub fn staging(&self) -> StagingRecovery {
        self.staging
    }

    /// Waiting tasks that were given a fresh request at startup.
    pub fn resubmitted(&self) -> usize {
        self.resubmitted
    }

    /// Ask every listener to stop after its current iteration. With `wait`,
    /// return only once all of them have exited.
    pub async fn shutdown(self, wait: bool) {
        // Receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        if !wait {
            return;
        }
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "Worker thread ended abnormally");
            }
        }
        info!("Worker process stopped");
    }
}
