use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;

use pipeline_worker::alert::LoggingAlertService;
use pipeline_worker::config::WorkerConfig;
use pipeline_worker::error::ModuleError;
use pipeline_worker::filestore::{FileTransaction, LocalFileStore};
use pipeline_worker::messaging::{InMemoryBroker, MessageBroker, RedisBroker};
use pipeline_worker::module::{ModuleRegistry, PipelineModule};
use pipeline_worker::pipeline::PipelineExecutor;
use pipeline_worker::pipeline::model::{
    DEFAULT_PRIORITY, PipelineDefinition, PipelineInstance, PipelineTask,
};
use pipeline_worker::status::status_routes;
use pipeline_worker::store::{LibSqlStore, PipelineStore};
use pipeline_worker::transaction::strategy_for;
use pipeline_worker::worker::{DispatcherDeps, MemoryGate, ThreadContextRegistry, WorkerProcess};

/// Copies each task's unit of work into the file store.
struct CopyUow;

#[async_trait]
impl PipelineModule for CopyUow {
    fn name(&self) -> &str {
        "copy-uow"
    }

    async fn process(
        &mut self,
        instance: &PipelineInstance,
        task: &mut PipelineTask,
        files: &FileTransaction,
    ) -> Result<bool, ModuleError> {
        let name = format!("{}-{}.json", instance.id, task.id);
        files.write(&name, task.uow.0.to_string()).await?;
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env().context("reading configuration")?;

    eprintln!("Pipeline worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Host: {}", config.host);
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   File store: {}", config.filestore_root.display());
    eprintln!("   Status: http://{}/api/workers", config.status_addr);

    // ── Collaborators ────────────────────────────────────────────────────
    let store: Arc<dyn PipelineStore> = Arc::new(
        LibSqlStore::new_local(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let files = Arc::new(
        LocalFileStore::open_for_host(&config.filestore_root, &config.host)
            .await
            .with_context(|| format!("opening {}", config.filestore_root.display()))?,
    );
    let broker: Arc<dyn MessageBroker> = match &config.broker_url {
        Some(url) => {
            eprintln!("   Broker: {url}");
            Arc::new(
                RedisBroker::connect(url, &config.host)
                    .await
                    .with_context(|| format!("connecting to {url}"))?,
            )
        }
        None => {
            eprintln!("   Broker: in-process (requests do not survive a restart)");
            Arc::new(InMemoryBroker::new())
        }
    };

    let modules = Arc::new(ModuleRegistry::new());
    modules.register("copy-uow", || Box::new(CopyUow));

    let memory_gate = if !config.memory_gate_enabled {
        None
    } else if let Some(budget) = config.memory_budget_mb {
        Some(Arc::new(MemoryGate::new(budget)))
    } else {
        MemoryGate::from_system().map(Arc::new)
    };
    if let Some(gate) = &memory_gate {
        eprintln!("   Memory budget: {} MB", gate.budget_mb());
    }

    let executor = Arc::new(PipelineExecutor::new(
        Arc::clone(&store),
        Arc::clone(&broker),
    ));
    let contexts = Arc::new(ThreadContextRegistry::new());
    let deps = DispatcherDeps {
        store: Arc::clone(&store),
        broker: Arc::clone(&broker),
        file_store: files.clone(),
        modules,
        memory_gate,
        transactions: strategy_for(config.use_xa, Arc::clone(&store), files),
        alerts: Arc::new(LoggingAlertService),
        contexts: Arc::clone(&contexts),
        executor: Arc::clone(&executor),
    };

    // ── Pipeline events ─────────────────────────────────────────────────
    let mut events = broker.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    instance_id = %event.instance_id,
                    kind = ?event.kind,
                    "Pipeline event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Pipeline event listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Workers ─────────────────────────────────────────────────────────
    let process = WorkerProcess::start(&config, deps).await?;
    let recovered = process.recovered();
    if recovered.total_updated_task_count > 0 {
        eprintln!(
            "   Recovered {} stale tasks across {} instances",
            recovered.total_updated_task_count,
            recovered.unique_instance_ids.len()
        );
    }
    if process.resubmitted() > 0 {
        eprintln!("   Resubmitted {} waiting tasks", process.resubmitted());
    }
    eprintln!("   Worker threads: {}", process.thread_count());

    // Optional pipeline definition to launch at startup
    if let Some(path) = std::env::args().nth(1) {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        let definition: PipelineDefinition =
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
        let instance = executor
            .launch(&definition, &definition.name, DEFAULT_PRIORITY)
            .await?;
        eprintln!("   Launched instance {} of {}", instance.id, definition.name);
    }

    // ── Status server ───────────────────────────────────────────────────
    let app = status_routes(Arc::clone(&contexts));
    let listener = tokio::net::TcpListener::bind(&config.status_addr)
        .await
        .with_context(|| format!("binding {}", config.status_addr))?;
    tracing::info!(addr = %config.status_addr, "Status server started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Status server stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    eprintln!("Shutting down; waiting for running tasks");
    process.shutdown(true).await;
    Ok(())
}
