//! End-to-end tests: a libSQL-backed pipeline driven by real dispatchers,
//! a simulated crash, and the status server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;

use pipeline_worker::alert::RecordingAlertService;
use pipeline_worker::config::{HostOverrides, WorkerConfig};
use pipeline_worker::error::ModuleError;
use pipeline_worker::filestore::{FileTransaction, LocalFileStore, RetryPolicy};
use pipeline_worker::messaging::messages::task_request_queue_name;
use pipeline_worker::messaging::{InMemoryBroker, MessageBroker, PriorityQueuePool};
use pipeline_worker::module::{ModuleRegistry, PipelineModule};
use pipeline_worker::pipeline::PipelineExecutor;
use pipeline_worker::pipeline::model::{
    InstanceState, PipelineDefinition, PipelineInstance, PipelineTask, StageDefinition,
    TaskState, UnitOfWork,
};
use pipeline_worker::status::status_routes;
use pipeline_worker::store::{LibSqlStore, PipelineStore};
use pipeline_worker::transaction::strategy_for;
use pipeline_worker::worker::{
    DispatcherDeps, DispatcherSettings, ThreadContextRegistry, WorkerProcess,
    WorkerTaskDispatcher,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const HOST: &str = "node-7";

/// Writes a calibrated frame per task; rejects units of work marked `"saturated"`.
struct Calibrate;

#[async_trait]
impl PipelineModule for Calibrate {
    fn name(&self) -> &str {
        "calibrate"
    }

    async fn process(
        &mut self,
        _instance: &PipelineInstance,
        task: &mut PipelineTask,
        files: &FileTransaction,
    ) -> Result<bool, ModuleError> {
        if task.uow.0.get("saturated").and_then(Value::as_bool) == Some(true) {
            return Err(ModuleError::ProcessingFailed {
                name: "calibrate".into(),
                reason: "saturated frame".into(),
            });
        }
        files
            .write(&format!("frame-{}.json", task.id), task.uow.0.to_string())
            .await?;
        Ok(true)
    }
}

struct Env {
    _dir: tempfile::TempDir,
    store: Arc<dyn PipelineStore>,
    broker: Arc<InMemoryBroker>,
    alerts: Arc<RecordingAlertService>,
    executor: Arc<PipelineExecutor>,
    deps: DispatcherDeps,
}

async fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PipelineStore> =
        Arc::new(LibSqlStore::new_local(&dir.path().join("pipeline.db")).await.unwrap());
    let broker = Arc::new(InMemoryBroker::new());
    let files = Arc::new(LocalFileStore::open(dir.path().join("fs")).await.unwrap());
    let alerts = Arc::new(RecordingAlertService::new());

    let modules = Arc::new(ModuleRegistry::new());
    modules.register("calibrate", || Box::new(Calibrate));

    let broker_dyn: Arc<dyn MessageBroker> = broker.clone();
    let executor = Arc::new(PipelineExecutor::new(Arc::clone(&store), Arc::clone(&broker_dyn)));
    let deps = DispatcherDeps {
        store: Arc::clone(&store),
        broker: broker_dyn,
        file_store: files.clone(),
        modules,
        memory_gate: None,
        transactions: strategy_for(true, Arc::clone(&store), files),
        alerts: alerts.clone(),
        contexts: Arc::new(ThreadContextRegistry::new()),
        executor: Arc::clone(&executor),
    };

    Env {
        _dir: dir,
        store,
        broker,
        alerts,
        executor,
        deps,
    }
}

fn settings() -> DispatcherSettings {
    DispatcherSettings {
        host: HOST.into(),
        software_revision: "integration".into(),
        task_log_dir: None,
        max_start_jitter: Duration::ZERO,
        filestore_retry: RetryPolicy::default(),
    }
}

fn config(threads: usize) -> WorkerConfig {
    WorkerConfig {
        host: HOST.into(),
        worker_threads: threads,
        poll_interval: Duration::from_millis(10),
        error_pause: Duration::from_millis(10),
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn crash_mid_stage_is_repaired_on_restart() {
    let env = env().await;
    let definition = PipelineDefinition {
        name: "nightly".into(),
        stages: vec![StageDefinition::new("calibrate").with_units_of_work(vec![
            UnitOfWork::new(serde_json::json!({"ccd": 1})),
            UnitOfWork::new(serde_json::json!({"ccd": 2})),
            UnitOfWork::new(serde_json::json!({"ccd": 3, "saturated": true})),
            UnitOfWork::new(serde_json::json!({"ccd": 4})),
        ])],
    };
    let instance = env.executor.launch(&definition, "nightly-1", 1).await.unwrap();

    // First process: three requests run to completion (one fails)
    let pool = PriorityQueuePool::new(env.deps.broker.clone());
    let mut dispatcher = WorkerTaskDispatcher::new(0, env.deps.clone(), settings());
    for _ in 0..3 {
        let delivery = pool.get_next_message().await.unwrap().unwrap();
        let _ = dispatcher.process_message(delivery).await;
    }
    assert_eq!(env.alerts.alerts().len(), 1);

    // The fourth is claimed, then the process dies before finishing it
    let delivery = pool.get_next_message().await.unwrap().unwrap();
    let mut tx = env.store.begin().await.unwrap();
    let mut task = tx.require_task(delivery.request().task_id).await.unwrap();
    task.state = TaskState::Processing;
    task.worker_host = Some(HOST.into());
    tx.save_task(&task).await.unwrap();
    tx.commit().await.unwrap();
    drop(delivery);
    drop(dispatcher);

    // Restart
    let process = WorkerProcess::start_with_overrides(
        &config(1),
        &HostOverrides::default(),
        env.deps.clone(),
    )
    .await
    .unwrap();
    assert_eq!(process.recovered().total_updated_task_count, 1);
    assert!(process.recovered().unique_instance_ids.contains(&instance.id));

    // The leftover redelivery is discarded rather than rerun
    timeout(TEST_TIMEOUT, async {
        let queue = task_request_queue_name(1);
        while env.broker.in_flight() > 0 || env.broker.queue_depth(&queue) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    process.shutdown(true).await;

    let mut tx = env.store.begin().await.unwrap();
    let stage = tx.stages_for_instance(instance.id).await.unwrap().remove(0);
    assert_eq!(stage.counts.submitted, 4);
    assert_eq!(stage.counts.completed, 2);
    assert_eq!(stage.counts.failed, 2);
    let instance = tx.require_instance(instance.id).await.unwrap();
    assert_eq!(instance.state, InstanceState::ErrorsStalled);
    assert!(instance.end_processing_time.is_some());
    let states: Vec<TaskState> = tx
        .tasks_for_stage(stage.id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.state)
        .collect();
    assert_eq!(
        states,
        vec![
            TaskState::Completed,
            TaskState::Completed,
            TaskState::Error,
            TaskState::Error
        ]
    );
}

#[tokio::test]
async fn transition_only_rerun_is_idempotent() {
    let env = env().await;
    let definition = PipelineDefinition {
        name: "flat".into(),
        stages: vec![StageDefinition::new("calibrate").with_units_of_work(vec![
            UnitOfWork::new(serde_json::json!({"ccd": 1})),
        ])],
    };
    let instance = env.executor.launch(&definition, "flat-1", 0).await.unwrap();

    let process =
        WorkerProcess::start_with_overrides(&config(2), &HostOverrides::default(), env.deps.clone())
            .await
            .unwrap();

    let wait_for = |state: InstanceState| {
        let store = Arc::clone(&env.store);
        let id = instance.id;
        async move {
            timeout(TEST_TIMEOUT, async {
                loop {
                    let mut tx = store.begin().await.unwrap();
                    let current = tx.require_instance(id).await.unwrap();
                    tx.rollback().await.unwrap();
                    if current.state == state {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap();
        }
    };
    wait_for(InstanceState::Completed).await;

    // Rerunning a completed task is refused; a transition-only rerun
    // records another step and leaves everything completed
    let mut tx = env.store.begin().await.unwrap();
    let stage = tx.stages_for_instance(instance.id).await.unwrap().remove(0);
    let task = tx.tasks_for_stage(stage.id).await.unwrap().remove(0);
    tx.rollback().await.unwrap();
    assert_eq!(task.exec_log.len(), 1);
    assert!(env.executor.rerun_failed_task(task.id, false).await.is_err());
    env.executor.rerun_task(task.id, true).await.unwrap();

    let rerun = timeout(TEST_TIMEOUT, async {
        loop {
            let mut tx = env.store.begin().await.unwrap();
            let current = tx.require_task(task.id).await.unwrap();
            tx.rollback().await.unwrap();
            if current.exec_log.len() == 2 && current.exec_log[1].final_state.is_some() {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(rerun.state, TaskState::Completed);
    wait_for(InstanceState::Completed).await;

    process.shutdown(true).await;
}

#[tokio::test]
async fn status_server_lists_running_threads() {
    let env = env().await;
    let process =
        WorkerProcess::start_with_overrides(&config(2), &HostOverrides::default(), env.deps.clone())
            .await
            .unwrap();

    let app = status_routes(process.registry());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();

    // Listeners publish their first snapshot as soon as they start
    let workers: Vec<Value> = timeout(TEST_TIMEOUT, async {
        loop {
            let workers: Vec<Value> = client
                .get(format!("{base}/api/workers"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if workers.len() == 2 {
                break workers;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(workers.iter().all(|w| w["host"] == HOST && w["state"] == "IDLE"));

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["threads"]["total"], 2);

    let missing = client
        .get(format!("{base}/api/workers/5"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    process.shutdown(true).await;
}
