//! Per-thread task dispatcher.
//!
//! A dispatcher drives one dispatch request through the task lifecycle:
//!
//! 1. pre-processing: claim the task and append an execution record
//! 2. main processing: run the domain module inside the main transaction,
//!    behind the memory gate
//! 3. post-processing: record the outcome and close the execution record
//! 4. transition: refresh counts, create follow-on work, update the
//!    instance aggregate state
//!
//! Each phase commits on its own so a crash between phases leaves a state
//! that a redelivered request or startup recovery can pick up. The messaging
//! acknowledgement is committed whatever happens.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::alert::{AlertService, AlertSeverity};
use crate::config::WorkerConfig;
use crate::error::{DatabaseError, Error, ModuleError, Result, panic_message};
use crate::filestore::{FileStoreClient, RetryPolicy, ensure_connected};
use crate::messaging::{
    Delivery, MessageBroker, PipelineEventKind, PipelineInstanceEvent, WorkerTaskRequest,
};
use crate::module::{ModuleRegistry, PipelineModule};
use crate::pipeline::model::{ProcessingState, TaskExecutionLog, TaskState};
use crate::pipeline::{PipelineExecutor, TransitionOutbox};
use crate::store::{PipelineStore, StoreTransaction};
use crate::transaction::{MainTransaction, TransactionStrategy};
use crate::worker::context::{ThreadContextRegistry, WorkerThreadContext};
use crate::worker::memory_gate::MemoryGate;
use crate::worker::task_log::TaskLog;

/// Shared collaborators injected into every dispatcher.
#[derive(Clone)]
pub struct DispatcherDeps {
    pub store: Arc<dyn PipelineStore>,
    pub broker: Arc<dyn MessageBroker>,
    pub file_store: Arc<dyn FileStoreClient>,
    pub modules: Arc<ModuleRegistry>,
    pub memory_gate: Option<Arc<MemoryGate>>,
    pub transactions: Arc<dyn TransactionStrategy>,
    pub alerts: Arc<dyn AlertService>,
    pub contexts: Arc<ThreadContextRegistry>,
    pub executor: Arc<PipelineExecutor>,
}

/// Per-process settings a dispatcher needs.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub host: String,
    pub software_revision: String,
    pub task_log_dir: Option<PathBuf>,
    pub max_start_jitter: Duration,
    pub filestore_retry: RetryPolicy,
}

impl From<&WorkerConfig> for DispatcherSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            host: config.host.clone(),
            software_revision: config.software_revision.clone(),
            task_log_dir: config.task_log_dir.clone(),
            max_start_jitter: config.max_start_jitter,
            filestore_retry: config.filestore_retry.clone(),
        }
    }
}

/// Runs dispatch requests for one worker thread.
pub struct WorkerTaskDispatcher {
    thread_number: u32,
    deps: DispatcherDeps,
    settings: DispatcherSettings,
    context: WorkerThreadContext,
    /// Module of the current attempt, kept for post-processing and transition.
    module: Option<Box<dyn PipelineModule>>,
    min_memory_mb: u64,
    last_error: Option<String>,
}

impl WorkerTaskDispatcher {
    pub fn new(thread_number: u32, deps: DispatcherDeps, settings: DispatcherSettings) -> Self {
        let context = WorkerThreadContext::new(thread_number, settings.host.clone());
        Self {
            thread_number,
            deps,
            settings,
            context,
            module: None,
            min_memory_mb: 0,
            last_error: None,
        }
    }

    pub fn thread_number(&self) -> u32 {
        self.thread_number
    }

    pub fn context(&self) -> &WorkerThreadContext {
        &self.context
    }

    fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.deps.store
    }

    fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.deps.executor
    }

    async fn publish_status(&self) {
        self.deps.contexts.publish(self.context.snapshot()).await;
    }

    /// Back to idle, forgetting everything about the previous request.
    pub async fn reset(&mut self) {
        self.context.reset();
        self.module = None;
        self.min_memory_mb = 0;
        self.last_error = None;
        self.publish_status().await;
    }

    /// Run one dispatch request to completion and acknowledge it.
    pub async fn process_message(&mut self, delivery: Delivery) -> Result<()> {
        let request = delivery.request().clone();
        self.context.begin(request.clone());
        self.publish_status().await;

        let task_log = self.open_task_log(&request).await;
        let outcome = match &task_log {
            Some(log) => {
                self.run_attempt(&request)
                    .with_subscriber(log.dispatch())
                    .await
            }
            None => self.run_attempt(&request).await,
        };

        if let Err(e) = delivery.commit().await {
            error!(task_id = %request.task_id, error = %e, "Failed to commit messaging transaction");
        }
        if let Some(log) = task_log {
            log.close();
        }
        self.reset().await;
        outcome
    }

    async fn open_task_log(&self, request: &WorkerTaskRequest) -> Option<TaskLog> {
        let dir = self.settings.task_log_dir.as_ref()?;
        let step = match self.read_step_index(request).await {
            Ok(step) => step,
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "Cannot open task log");
                return None;
            }
        };
        match TaskLog::open(dir, request.instance_id, request.task_id, step) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "Cannot open task log");
                None
            }
        }
    }

    async fn read_step_index(
        &self,
        request: &WorkerTaskRequest,
    ) -> std::result::Result<usize, DatabaseError> {
        let mut tx = self.store().begin().await?;
        let task = tx.require_task(request.task_id).await;
        tx.rollback().await?;
        Ok(task?.next_step_index())
    }

    async fn start_jitter(&self) {
        let max_ms = self.settings.max_start_jitter.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let delay_ms = rand::thread_rng().gen_range(0..=max_ms);
        debug!(delay_ms, "Staggering task start");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    async fn run_attempt(&mut self, request: &WorkerTaskRequest) -> Result<()> {
        // Created here so the span belongs to the task log's subscriber
        let span = info_span!(
            "task",
            thread = self.thread_number,
            instance_id = %request.instance_id,
            task_id = %request.task_id,
        );
        self.run_phases(request).instrument(span).await
    }

    async fn run_phases(&mut self, request: &WorkerTaskRequest) -> Result<()> {
        self.start_jitter().await;

        info!("Executing pre-processing");
        let transition_only = match self.pre_processing(request).await {
            Ok(transition_only) => transition_only,
            Err(e) => return self.handle_failure(request, e).await,
        };

        let done = if transition_only {
            info!("Main work already done, running transition logic only");
            true
        } else {
            match self.process_task(request).await {
                Ok(done) => done,
                Err(e) => return self.handle_failure(request, e).await,
            }
        };

        info!(done, "Executing post-processing");
        if let Err(e) = self.post_processing(request, done, true, transition_only).await {
            return self.handle_failure(request, e).await;
        }

        if done {
            if let Err(e) = self.do_transition(request, true).await {
                return self.handle_failure(request, e).await;
            }
        } else {
            info!("More steps remain, resubmitting task");
            let mut outbox = TransitionOutbox::default();
            outbox.requests.push(WorkerTaskRequest {
                transition_only: false,
                ..request.clone()
            });
            if let Err(e) = self.executor().send(outbox).await {
                return self.handle_failure(request, e.into()).await;
            }
        }
        Ok(())
    }

    /// Record a failed attempt: mark the task `ERROR` and update counts.
    async fn handle_failure(&mut self, request: &WorkerTaskRequest, err: Error) -> Result<()> {
        error!(
            module = self.context.module_name.as_deref().unwrap_or("-"),
            uow = %self
                .context
                .task
                .as_ref()
                .map(|t| t.uow.brief_state())
                .unwrap_or_default(),
            error = %err,
            "Failed to process task request"
        );
        self.last_error = Some(err.to_string());

        // No task means it was never found; there is nothing to mark
        if self.context.task.is_some() {
            if let Err(e) = self.post_processing(request, true, false, false).await {
                error!(error = %e, "Post-processing of failed task failed");
            } else if let Err(e) = self.do_transition(request, false).await {
                error!(error = %e, "Transition of failed task failed");
            }
        }
        Err(err)
    }

    // ── Pre-processing ──────────────────────────────────────────────

    async fn pre_processing(&mut self, request: &WorkerTaskRequest) -> Result<bool> {
        let mut tx = self.store().begin().await?;
        match self.pre_processing_in(tx.as_mut(), request).await {
            Ok(transition_only) => {
                tx.commit().await?;
                self.publish_status().await;
                Ok(transition_only)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback of pre-processing failed");
                }
                Err(e)
            }
        }
    }

    async fn pre_processing_in(
        &mut self,
        tx: &mut dyn StoreTransaction,
        request: &WorkerTaskRequest,
    ) -> Result<bool> {
        let mut task = tx.require_task(request.task_id).await?;
        self.context.task = Some(task.clone());
        let instance = tx.require_instance(request.instance_id).await?;
        let stage = tx.require_stage(task.stage_id).await?;
        self.context.instance = Some(instance);
        self.context.set_stage(&stage);
        self.min_memory_mb = stage.min_memory_mb;

        task.exec_log.push(TaskExecutionLog::start(
            &self.settings.host,
            self.thread_number,
            &task,
        ));

        if task.state == TaskState::Error {
            self.executor()
                .decrement_failed_count(tx, task.stage_id)
                .await?;
        }

        let transition_only = request.transition_only || task.state.is_main_work_done();
        if !transition_only {
            task.state = TaskState::Processing;
            task.worker_host = Some(self.settings.host.clone());
            task.worker_thread = Some(self.thread_number);
            task.software_revision = Some(self.settings.software_revision.clone());
            task.transition_complete = false;
            if task.start_processing_time.is_none() {
                task.start_processing_time = self.context.processing_start;
            }
        }

        tx.save_task(&task).await?;
        debug!(step = task.exec_log.len(), state = %task.state, transition_only, "Task claimed");
        self.context.task = Some(task);
        Ok(transition_only)
    }

    // ── Main processing ─────────────────────────────────────────────

    async fn process_task(&mut self, request: &WorkerTaskRequest) -> Result<bool> {
        let reservation = match &self.deps.memory_gate {
            Some(gate) => Some(gate.acquire(self.min_memory_mb).await),
            None => None,
        };

        let result = self.run_module(request).await;

        if let Some(reservation) = reservation {
            reservation.release();
        }
        result
    }

    async fn run_module(&mut self, request: &WorkerTaskRequest) -> Result<bool> {
        ensure_connected(
            self.deps.file_store.as_ref(),
            &self.settings.filestore_retry,
        )
        .await?;

        let strategy = Arc::clone(&self.deps.transactions);
        debug!(strategy = strategy.name(), "Starting main transaction");
        let mut tx = strategy.begin().await?;

        let done = match self.run_module_in(&mut tx, request).await {
            Ok(done) => done,
            Err(e) => {
                if let Err(rb) = strategy.rollback(tx).await {
                    error!(error = %rb, "Failed to roll back main transaction");
                }
                return Err(e);
            }
        };

        let started = Instant::now();
        strategy.commit(tx).await?;
        self.context
            .metrics
            .add("commit_ms", started.elapsed().as_millis() as u64);
        info!("Main transaction committed");

        if done {
            self.mark_processing_complete(request).await?;
        }
        Ok(done)
    }

    async fn run_module_in(
        &mut self,
        tx: &mut MainTransaction,
        request: &WorkerTaskRequest,
    ) -> Result<bool> {
        let instance = tx.store.require_instance(request.instance_id).await?;
        let mut task = tx.store.require_task(request.task_id).await?;
        let stage = tx.store.require_stage(task.stage_id).await?;

        let mut module = self.deps.modules.create(&stage.module_name)?;
        info!(
            module = %stage.module_name,
            uow = %task.uow.brief_state(),
            remote = self.context.current_task_is_remote(),
            "Calling module"
        );

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async {
            module.initialize(&task).await?;
            module.process(&instance, &mut task, &tx.files).await
        })
        .catch_unwind()
        .await;
        self.context
            .metrics
            .add("module_exec_ms", started.elapsed().as_millis() as u64);

        // A module that panicked is not asked anything else
        let outcome = match outcome {
            Ok(outcome) => {
                self.module = Some(module);
                outcome
            }
            Err(payload) => Err(ModuleError::Panicked {
                name: stage.module_name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        };

        let done = outcome?;
        task.restart_mode = None;
        tx.store.save_task(&task).await?;
        self.context.task = Some(task);
        self.context.instance = Some(instance);
        Ok(done)
    }

    async fn mark_processing_complete(&self, request: &WorkerTaskRequest) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let mut task = tx.require_task(request.task_id).await?;
        task.attributes.state = ProcessingState::Complete;
        tx.save_task(&task).await?;
        tx.commit().await?;
        Ok(())
    }

    // ── Post-processing ─────────────────────────────────────────────

    async fn post_processing(
        &mut self,
        request: &WorkerTaskRequest,
        done: bool,
        success: bool,
        transition_only: bool,
    ) -> Result<()> {
        let mut tx = self.store().begin().await?;
        match self
            .post_processing_in(tx.as_mut(), request, done, success, transition_only)
            .await
        {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback of post-processing failed");
                }
                Err(e)
            }
        }
    }

    async fn post_processing_in(
        &mut self,
        tx: &mut dyn StoreTransaction,
        request: &WorkerTaskRequest,
        done: bool,
        success: bool,
        transition_only: bool,
    ) -> Result<()> {
        let mut task = tx.require_task(request.task_id).await?;
        let now = Utc::now();
        let elapsed_ms = self
            .context
            .processing_start
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        info!(elapsed_ms, "Processing time for this step");

        match &self.module {
            Some(module) => module.update_metrics(&mut task, &self.context.metrics, elapsed_ms),
            None => {
                task.summary_metrics
                    .insert("processing_ms".to_string(), elapsed_ms as f64);
            }
        }

        if done {
            if !success {
                task.end_processing_time = Some(now);
                task.state = TaskState::Error;
                task.failure_count += 1;
                let module = self.context.module_name.as_deref().unwrap_or("unknown");
                self.deps.alerts.generate_alert(
                    &format!("worker({module})"),
                    Some(task.id),
                    AlertSeverity::Error,
                    self.last_error.as_deref().unwrap_or("task failed"),
                );
            } else if !transition_only || !task.state.is_main_work_done() {
                // A transition-only override of unfinished work counts as done
                task.end_processing_time = Some(now);
                let partial = self.module.as_ref().is_some_and(|m| m.is_partial_success());
                task.state = if partial {
                    TaskState::Partial
                } else {
                    TaskState::Completed
                };
            }
        }

        match task.exec_log.last_mut() {
            Some(record) => {
                record.end_processing_time = Some(now);
                record.final_state = Some(task.state);
                record.final_processing_state = Some(task.attributes.state);
            }
            None => warn!("Execution record missing for task"),
        }

        tx.save_task(&task).await?;
        info!(state = %task.state, failures = task.failure_count, "Task updated");
        self.context.task = Some(task);
        Ok(())
    }

    // ── Transition ──────────────────────────────────────────────────

    async fn do_transition(&mut self, request: &WorkerTaskRequest, success: bool) -> Result<()> {
        let mut tx = self.store().begin().await?;
        match self.transition_in(tx.as_mut(), request, success).await {
            Ok(outbox) => {
                tx.commit().await?;
                self.executor().send(outbox).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback of transition failed");
                }
                Err(e)
            }
        }
    }

    async fn transition_in(
        &mut self,
        tx: &mut dyn StoreTransaction,
        request: &WorkerTaskRequest,
        success: bool,
    ) -> Result<TransitionOutbox> {
        let instance = tx.require_instance(request.instance_id).await?;
        let mut task = tx.require_task(request.task_id).await?;
        let executor = Arc::clone(self.executor());

        let stage = executor.update_task_counts(tx, task.stage_id).await?;
        let mut outbox = TransitionOutbox::default();

        let halt = self
            .module
            .as_ref()
            .is_some_and(|m| m.is_halt_pipeline_on_task_completion());
        if halt {
            info!("Module halts the pipeline on completion, skipping transition logic");
        } else if !success {
            info!("Not executing transition logic because the task failed");
        } else if task.transition_complete {
            info!("Transition already complete for task");
        } else {
            info!("Executing transition logic");
            outbox.extend(executor.do_transition(tx, &instance, &stage, &task).await?);
            task.transition_complete = true;
            tx.save_task(&task).await?;
        }

        let (instance, finish) = executor.update_instance_state(tx, instance.id).await?;
        outbox.events.extend(finish);
        if !success {
            outbox.events.push(PipelineInstanceEvent::new(
                PipelineEventKind::Failure,
                instance.id,
                instance.priority,
            ));
        }
        self.context.task = Some(task);
        Ok(outbox)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::alert::RecordingAlertService;
    use crate::error::ModuleError;
    use crate::filestore::{FileTransaction, LocalFileStore};
    use crate::messaging::{InMemoryBroker, PriorityQueuePool};
    use crate::pipeline::model::{
        InstanceState, PipelineDefinition, PipelineInstance, PipelineTask, StageDefinition,
        UnitOfWork,
    };
    use crate::store::InMemoryStore;
    use crate::transaction::strategy_for;

    /// Writes the unit of work to the file store; fails on `"fail": true`
    /// and panics on `"panic": true` after staging its output.
    struct WriteUow {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PipelineModule for WriteUow {
        fn name(&self) -> &str {
            "write"
        }

        async fn process(
            &mut self,
            _instance: &PipelineInstance,
            task: &mut PipelineTask,
            files: &FileTransaction,
        ) -> std::result::Result<bool, ModuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if task.uow.0.get("fail").and_then(|v| v.as_bool()) == Some(true) {
                return Err(ModuleError::ProcessingFailed {
                    name: "write".into(),
                    reason: "bad pixels".into(),
                });
            }
            files
                .write(&format!("task-{}.json", task.id), task.uow.0.to_string())
                .await?;
            if task.uow.0.get("panic").and_then(|v| v.as_bool()) == Some(true) {
                panic!("pixel index out of range");
            }
            Ok(true)
        }
    }

    struct Harness {
        store: InMemoryStore,
        broker: InMemoryBroker,
        files: Arc<LocalFileStore>,
        alerts: Arc<RecordingAlertService>,
        calls: Arc<AtomicUsize>,
        dispatcher: WorkerTaskDispatcher,
        executor: Arc<PipelineExecutor>,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let files = Arc::new(LocalFileStore::open(dir.path().join("fs")).await.unwrap());
        let alerts = Arc::new(RecordingAlertService::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let modules = Arc::new(ModuleRegistry::new());
        let module_calls = Arc::clone(&calls);
        modules.register("write", move || {
            Box::new(WriteUow {
                calls: Arc::clone(&module_calls),
            })
        });

        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
        ));
        let deps = DispatcherDeps {
            store: Arc::new(store.clone()),
            broker: Arc::new(broker.clone()),
            file_store: files.clone(),
            modules,
            memory_gate: Some(Arc::new(MemoryGate::new(1024))),
            transactions: strategy_for(true, Arc::new(store.clone()), files.clone()),
            alerts: alerts.clone(),
            contexts: Arc::new(ThreadContextRegistry::new()),
            executor: Arc::clone(&executor),
        };
        let settings = DispatcherSettings {
            host: "worker-a".into(),
            software_revision: "test@1".into(),
            task_log_dir: Some(dir.path().join("logs")),
            max_start_jitter: Duration::ZERO,
            filestore_retry: RetryPolicy::default(),
        };

        Harness {
            store,
            broker,
            files,
            alerts,
            calls,
            dispatcher: WorkerTaskDispatcher::new(0, deps, settings),
            executor,
            dir,
        }
    }

    async fn launch(h: &Harness, uows: Vec<UnitOfWork>, stages: usize) -> PipelineInstance {
        let mut defs = vec![StageDefinition::new("write").with_units_of_work(uows)];
        for _ in 1..stages {
            defs.push(StageDefinition::new("write"));
        }
        let definition = PipelineDefinition {
            name: "test".into(),
            stages: defs,
        };
        h.executor.launch(&definition, "run", 1).await.unwrap()
    }

    async fn next(h: &Harness) -> Option<Delivery> {
        PriorityQueuePool::new(Arc::new(h.broker.clone()))
            .get_next_message()
            .await
            .unwrap()
    }

    async fn task(h: &Harness, id: crate::pipeline::model::TaskId) -> PipelineTask {
        let mut tx = h.store.begin().await.unwrap();
        tx.require_task(id).await.unwrap()
    }

    async fn instance(h: &Harness, id: crate::pipeline::model::InstanceId) -> PipelineInstance {
        let mut tx = h.store.begin().await.unwrap();
        tx.require_instance(id).await.unwrap()
    }

    #[tokio::test]
    async fn successful_task_completes_and_transitions() {
        let mut h = harness().await;
        let launched = launch(&h, vec![UnitOfWork::new(serde_json::json!({"ccd": 1}))], 2).await;

        let delivery = next(&h).await.unwrap();
        let task_id = delivery.request().task_id;
        h.dispatcher.process_message(delivery).await.unwrap();

        let done = task(&h, task_id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert!(done.transition_complete);
        assert_eq!(done.exec_log.len(), 1);
        assert_eq!(done.exec_log[0].initial_state, TaskState::Submitted);
        assert_eq!(done.exec_log[0].final_state, Some(TaskState::Completed));
        assert_eq!(done.attributes.state, ProcessingState::Complete);
        assert_eq!(done.worker_host.as_deref(), Some("worker-a"));
        assert!(done.summary_metrics.contains_key("module_exec_ms"));
        assert!(
            h.files
                .read(&format!("task-{task_id}.json"))
                .await
                .unwrap()
                .is_some()
        );

        // Next stage task was queued
        let follow_on = next(&h).await.unwrap();
        assert_ne!(follow_on.request().task_id, task_id);
        h.dispatcher.process_message(follow_on).await.unwrap();
        assert_eq!(
            instance(&h, launched.id).await.state,
            InstanceState::Completed
        );
        assert_eq!(h.broker.in_flight(), 0);
        assert!(h.dispatcher.context().task.is_none());
    }

    #[tokio::test]
    async fn module_failure_marks_error_and_alerts() {
        let mut h = harness().await;
        let mut events = h.broker.subscribe_events();
        let launched = launch(
            &h,
            vec![UnitOfWork::new(serde_json::json!({"fail": true}))],
            1,
        )
        .await;
        let _start = events.recv().await.unwrap();

        let delivery = next(&h).await.unwrap();
        let task_id = delivery.request().task_id;
        assert!(h.dispatcher.process_message(delivery).await.is_err());

        let failed = task(&h, task_id).await;
        assert_eq!(failed.state, TaskState::Error);
        assert_eq!(failed.failure_count, 1);
        assert!(!failed.transition_complete);
        assert_eq!(failed.exec_log[0].final_state, Some(TaskState::Error));

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].task_id, Some(task_id));
        assert!(alerts[0].message.contains("bad pixels"));

        assert_eq!(
            instance(&h, launched.id).await.state,
            InstanceState::ErrorsStalled
        );
        assert_eq!(events.recv().await.unwrap().kind, PipelineEventKind::Failure);
        // The request was acknowledged despite the failure
        assert_eq!(h.broker.in_flight(), 0);
        assert!(next(&h).await.is_none());
    }

    #[tokio::test]
    async fn module_panic_fails_task_and_discards_output() {
        let mut h = harness().await;
        let launched = launch(
            &h,
            vec![UnitOfWork::new(serde_json::json!({"panic": true}))],
            1,
        )
        .await;

        let delivery = next(&h).await.unwrap();
        let task_id = delivery.request().task_id;
        let err = h.dispatcher.process_message(delivery).await.unwrap_err();
        assert!(matches!(err, Error::Module(ModuleError::Panicked { .. })));

        let failed = task(&h, task_id).await;
        assert_eq!(failed.state, TaskState::Error);
        assert_eq!(failed.failure_count, 1);
        assert_eq!(failed.exec_log[0].final_state, Some(TaskState::Error));
        assert!(failed.end_processing_time.is_some());

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("pixel index out of range"));

        assert_eq!(
            instance(&h, launched.id).await.state,
            InstanceState::ErrorsStalled
        );
        // Staged output was rolled back and the request acknowledged
        assert!(
            h.files
                .read(&format!("task-{task_id}.json"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(std::fs::read_dir(h.files.staging_dir()).unwrap().count(), 0);
        assert_eq!(h.broker.in_flight(), 0);
        assert!(next(&h).await.is_none());
    }

    #[tokio::test]
    async fn transition_only_rerun_of_failed_task_completes_it() {
        let mut h = harness().await;
        let launched = launch(
            &h,
            vec![UnitOfWork::new(serde_json::json!({"fail": true}))],
            1,
        )
        .await;

        let first = next(&h).await.unwrap();
        let task_id = first.request().task_id;
        let _ = h.dispatcher.process_message(first).await;
        assert_eq!(task(&h, task_id).await.state, TaskState::Error);

        // Operator declares the work done and asks only for the transition
        h.executor.rerun_failed_task(task_id, true).await.unwrap();
        let rerun = next(&h).await.unwrap();
        assert!(rerun.request().transition_only);
        h.dispatcher.process_message(rerun).await.unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let done = task(&h, task_id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert!(done.transition_complete);
        assert_eq!(done.exec_log[1].final_state, Some(TaskState::Completed));

        let mut tx = h.store.begin().await.unwrap();
        let stage = tx.require_stage(done.stage_id).await.unwrap();
        assert_eq!(stage.counts.completed, 1);
        assert_eq!(stage.counts.failed, 0);
        tx.rollback().await.unwrap();
        assert_eq!(
            instance(&h, launched.id).await.state,
            InstanceState::Completed
        );
    }

    #[tokio::test]
    async fn completed_task_redelivery_only_transitions() {
        let mut h = harness().await;
        launch(&h, vec![UnitOfWork::new(serde_json::json!({"ccd": 2}))], 1).await;

        let delivery = next(&h).await.unwrap();
        let request = delivery.request().clone();
        h.dispatcher.process_message(delivery).await.unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        // A second request for the same task must not run the module again
        h.executor.rerun_task(request.task_id, false).await.unwrap();
        let again = next(&h).await.unwrap();
        h.dispatcher.process_message(again).await.unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let done = task(&h, request.task_id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.exec_log.len(), 2);
        assert_eq!(done.exec_log[1].initial_state, TaskState::Completed);
        assert_eq!(done.exec_log[1].final_state, Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn retried_error_task_corrects_failed_count() {
        let mut h = harness().await;
        let launched = launch(
            &h,
            vec![
                UnitOfWork::new(serde_json::json!({"fail": true})),
                UnitOfWork::new(serde_json::json!({"ccd": 3})),
            ],
            1,
        )
        .await;

        let first = next(&h).await.unwrap();
        let failing = first.request().clone();
        let _ = h.dispatcher.process_message(first).await;
        let second = next(&h).await.unwrap();
        h.dispatcher.process_message(second).await.unwrap();
        assert_eq!(
            instance(&h, launched.id).await.state,
            InstanceState::ErrorsStalled
        );

        // Operator fixes the input and resubmits
        {
            let mut tx = h.store.begin().await.unwrap();
            let mut t = tx.require_task(failing.task_id).await.unwrap();
            t.uow = UnitOfWork::new(serde_json::json!({"ccd": 4}));
            tx.save_task(&t).await.unwrap();
            tx.commit().await.unwrap();
        }
        h.executor
            .rerun_failed_task(failing.task_id, false)
            .await
            .unwrap();
        let retry = next(&h).await.unwrap();
        h.dispatcher.process_message(retry).await.unwrap();

        let mut tx = h.store.begin().await.unwrap();
        let retried = tx.require_task(failing.task_id).await.unwrap();
        assert_eq!(retried.state, TaskState::Completed);
        assert!(retried.retry);
        let stage = tx.require_stage(retried.stage_id).await.unwrap();
        assert_eq!(stage.counts.failed, 0);
        assert_eq!(stage.counts.completed, 2);
        assert_eq!(
            instance(&h, launched.id).await.state,
            InstanceState::Completed
        );
    }

    #[tokio::test]
    async fn missing_task_is_acknowledged() {
        let mut h = harness().await;
        let launched = launch(&h, vec![UnitOfWork::default()], 1).await;
        h.broker
            .send(
                "worker-task-requests-1",
                WorkerTaskRequest {
                    instance_id: launched.id,
                    task_id: crate::pipeline::model::TaskId(9999),
                    stage_id: crate::pipeline::model::StageId(1),
                    priority: 1,
                    transition_only: false,
                },
            )
            .await
            .unwrap();

        // Drain the real task first, then the bogus one
        let real = next(&h).await.unwrap();
        h.dispatcher.process_message(real).await.unwrap();
        let bogus = next(&h).await.unwrap();
        let err = h.dispatcher.process_message(bogus).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Database(DatabaseError::NotFound { .. })
        ));
        assert!(h.alerts.alerts().is_empty());
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn task_log_written_per_step() {
        let mut h = harness().await;
        let launched = launch(&h, vec![UnitOfWork::default()], 1).await;
        let delivery = next(&h).await.unwrap();
        let task_id = delivery.request().task_id;
        h.dispatcher.process_message(delivery).await.unwrap();

        let path = h
            .dir
            .path()
            .join("logs")
            .join(format!("{}-{}-0.log", launched.id, task_id));
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("Executing pre-processing"));
    }
}
