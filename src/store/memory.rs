//! In-process store used by tests and single-host deployments.
//!
//! Writes are buffered per transaction and applied atomically on commit.
//! Row locks are async mutexes keyed by stage or instance id and are held by
//! the transaction until it commits, rolls back, or is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::model::{
    InstanceId, InstanceState, PipelineInstance, PipelineStage, PipelineTask, StageDefinition,
    StageId, TaskCounts, TaskId, TaskState, UnitOfWork,
};
use crate::store::traits::{PipelineStore, StoreTransaction};

#[derive(Debug, Default, Clone)]
struct Tables {
    instances: BTreeMap<InstanceId, PipelineInstance>,
    stages: BTreeMap<StageId, PipelineStage>,
    tasks: BTreeMap<TaskId, PipelineTask>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.stages.is_empty() && self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Instance(InstanceId),
    Stage(StageId),
}

#[derive(Default)]
struct Shared {
    committed: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<Mutex<()>>>>,
    next_id: AtomicI64,
}

/// In-memory [`PipelineStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            pending: Tables::default(),
            held: HashMap::new(),
        }))
    }
}

/// Transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    pending: Tables,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn next_id(&self) -> i64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn acquire(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = {
            let mut locks = self.shared.row_locks.lock().await;
            Arc::clone(locks.entry(key).or_default())
        };
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    async fn committed_instance(&self, id: InstanceId) -> Option<PipelineInstance> {
        self.shared.committed.lock().await.instances.get(&id).cloned()
    }

    async fn committed_stage(&self, id: StageId) -> Option<PipelineStage> {
        self.shared.committed.lock().await.stages.get(&id).cloned()
    }

    /// Committed tasks overlaid with this transaction's pending writes.
    async fn visible_tasks(&self, filter: impl Fn(&PipelineTask) -> bool) -> Vec<PipelineTask> {
        let mut merged: BTreeMap<TaskId, PipelineTask> = self
            .shared
            .committed
            .lock()
            .await
            .tasks
            .iter()
            .map(|(id, t)| (*id, t.clone()))
            .collect();
        merged.extend(self.pending.tasks.iter().map(|(id, t)| (*id, t.clone())));
        merged.into_values().filter(|t| filter(t)).collect()
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn create_instance(
        &mut self,
        name: &str,
        priority: u8,
    ) -> Result<PipelineInstance, DatabaseError> {
        let instance = PipelineInstance {
            id: InstanceId(self.next_id()),
            name: name.to_string(),
            priority,
            state: InstanceState::Initialized,
            start_processing_time: None,
            end_processing_time: None,
        };
        self.pending.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn instance(&mut self, id: InstanceId) -> Result<Option<PipelineInstance>, DatabaseError> {
        if let Some(instance) = self.pending.instances.get(&id) {
            return Ok(Some(instance.clone()));
        }
        Ok(self.committed_instance(id).await)
    }

    async fn lock_instance(
        &mut self,
        id: InstanceId,
    ) -> Result<Option<PipelineInstance>, DatabaseError> {
        self.acquire(RowKey::Instance(id)).await;
        self.instance(id).await
    }

    async fn save_instance(&mut self, instance: &PipelineInstance) -> Result<(), DatabaseError> {
        self.pending.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn create_stage(
        &mut self,
        instance_id: InstanceId,
        position: u32,
        definition: &StageDefinition,
        total: u32,
    ) -> Result<PipelineStage, DatabaseError> {
        let stage = PipelineStage {
            id: StageId(self.next_id()),
            instance_id,
            position,
            module_name: definition.module_name.clone(),
            min_memory_mb: definition.min_memory_mb,
            start_new_uow: definition.start_new_uow,
            remote_execution: definition.remote_execution,
            units_of_work: definition.units_of_work.clone(),
            counts: TaskCounts {
                total,
                ..TaskCounts::default()
            },
        };
        self.pending.stages.insert(stage.id, stage.clone());
        Ok(stage)
    }

    async fn stage(&mut self, id: StageId) -> Result<Option<PipelineStage>, DatabaseError> {
        if let Some(stage) = self.pending.stages.get(&id) {
            return Ok(Some(stage.clone()));
        }
        Ok(self.committed_stage(id).await)
    }

    async fn lock_stage(&mut self, id: StageId) -> Result<Option<PipelineStage>, DatabaseError> {
        self.acquire(RowKey::Stage(id)).await;
        self.stage(id).await
    }

    async fn stages_for_instance(
        &mut self,
        instance_id: InstanceId,
    ) -> Result<Vec<PipelineStage>, DatabaseError> {
        let mut merged: BTreeMap<StageId, PipelineStage> = self
            .shared
            .committed
            .lock()
            .await
            .stages
            .values()
            .filter(|s| s.instance_id == instance_id)
            .map(|s| (s.id, s.clone()))
            .collect();
        merged.extend(
            self.pending
                .stages
                .values()
                .filter(|s| s.instance_id == instance_id)
                .map(|s| (s.id, s.clone())),
        );
        let mut stages: Vec<_> = merged.into_values().collect();
        stages.sort_by_key(|s| s.position);
        Ok(stages)
    }

    async fn save_stage(&mut self, stage: &PipelineStage) -> Result<(), DatabaseError> {
        self.pending.stages.insert(stage.id, stage.clone());
        Ok(())
    }

    async fn create_task(
        &mut self,
        instance_id: InstanceId,
        stage_id: StageId,
        uow: &UnitOfWork,
    ) -> Result<PipelineTask, DatabaseError> {
        let task = PipelineTask::new(TaskId(self.next_id()), instance_id, stage_id, uow.clone());
        self.pending.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn task(&mut self, id: TaskId) -> Result<Option<PipelineTask>, DatabaseError> {
        if let Some(task) = self.pending.tasks.get(&id) {
            return Ok(Some(task.clone()));
        }
        Ok(self.shared.committed.lock().await.tasks.get(&id).cloned())
    }

    async fn tasks_for_stage(
        &mut self,
        stage_id: StageId,
    ) -> Result<Vec<PipelineTask>, DatabaseError> {
        Ok(self.visible_tasks(|t| t.stage_id == stage_id).await)
    }

    async fn processing_tasks_on_host(
        &mut self,
        host: &str,
    ) -> Result<Vec<PipelineTask>, DatabaseError> {
        Ok(self
            .visible_tasks(|t| {
                t.state == TaskState::Processing && t.worker_host.as_deref() == Some(host)
            })
            .await)
    }

    async fn submitted_tasks(&mut self) -> Result<Vec<PipelineTask>, DatabaseError> {
        Ok(self
            .visible_tasks(|t| t.state == TaskState::Submitted)
            .await)
    }

    async fn save_task(&mut self, task: &PipelineTask) -> Result<(), DatabaseError> {
        self.pending.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DatabaseError> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            let mut committed = self.shared.committed.lock().await;
            committed.instances.extend(pending.instances);
            committed.stages.extend(pending.stages);
            committed.tasks.extend(pending.tasks);
        }
        debug!(locks = self.held.len(), "In-memory transaction committed");
        self.held.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DatabaseError> {
        self.pending = Tables::default();
        self.held.clear();
        Ok(())
    }
}
