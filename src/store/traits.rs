//! Backend-agnostic transactional store for pipeline entities.
//!
//! Every read and write goes through a [`StoreTransaction`]. Plain reads see
//! committed data; `lock_*` reads take a row lock held until commit or
//! rollback, serializing concurrent writers of the same stage or instance.
//! Lock order is stage before instance.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::model::{
    InstanceId, PipelineInstance, PipelineStage, PipelineTask, StageDefinition, StageId, TaskId,
    UnitOfWork,
};

/// Entry point of a store: hands out transactions.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Start a new transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError>;
}

/// A unit of work against the store.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    // ── Instances ───────────────────────────────────────────────────

    /// Create an instance in `INITIALIZED` state.
    async fn create_instance(
        &mut self,
        name: &str,
        priority: u8,
    ) -> Result<PipelineInstance, DatabaseError>;

    async fn instance(&mut self, id: InstanceId) -> Result<Option<PipelineInstance>, DatabaseError>;

    /// Read an instance and hold its row lock for the rest of the transaction.
    async fn lock_instance(
        &mut self,
        id: InstanceId,
    ) -> Result<Option<PipelineInstance>, DatabaseError>;

    async fn save_instance(&mut self, instance: &PipelineInstance) -> Result<(), DatabaseError>;

    // ── Stages ──────────────────────────────────────────────────────

    /// Create a stage with `total` planned tasks and zeroed counters.
    async fn create_stage(
        &mut self,
        instance_id: InstanceId,
        position: u32,
        definition: &StageDefinition,
        total: u32,
    ) -> Result<PipelineStage, DatabaseError>;

    async fn stage(&mut self, id: StageId) -> Result<Option<PipelineStage>, DatabaseError>;

    /// Read a stage and hold its row lock for the rest of the transaction.
    async fn lock_stage(&mut self, id: StageId) -> Result<Option<PipelineStage>, DatabaseError>;

    /// All stages of an instance, ordered by position.
    async fn stages_for_instance(
        &mut self,
        instance_id: InstanceId,
    ) -> Result<Vec<PipelineStage>, DatabaseError>;

    async fn save_stage(&mut self, stage: &PipelineStage) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Create a task in `INITIALIZED` state.
    async fn create_task(
        &mut self,
        instance_id: InstanceId,
        stage_id: StageId,
        uow: &UnitOfWork,
    ) -> Result<PipelineTask, DatabaseError>;

    async fn task(&mut self, id: TaskId) -> Result<Option<PipelineTask>, DatabaseError>;

    /// All tasks of a stage, ordered by id.
    async fn tasks_for_stage(&mut self, stage_id: StageId)
    -> Result<Vec<PipelineTask>, DatabaseError>;

    /// Tasks assigned to `host` whose state is still `PROCESSING`.
    async fn processing_tasks_on_host(
        &mut self,
        host: &str,
    ) -> Result<Vec<PipelineTask>, DatabaseError>;

    /// Tasks waiting in `SUBMITTED` state, ordered by id.
    async fn submitted_tasks(&mut self) -> Result<Vec<PipelineTask>, DatabaseError>;

    async fn save_task(&mut self, task: &PipelineTask) -> Result<(), DatabaseError>;

    // ── Completion ──────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;

    // ── Lookups that treat a missing row as an error ────────────────

    async fn require_instance(&mut self, id: InstanceId) -> Result<PipelineInstance, DatabaseError> {
        self.instance(id)
            .await?
            .ok_or_else(|| DatabaseError::instance_not_found(id))
    }

    async fn require_stage(&mut self, id: StageId) -> Result<PipelineStage, DatabaseError> {
        self.stage(id)
            .await?
            .ok_or_else(|| DatabaseError::stage_not_found(id))
    }

    async fn require_task(&mut self, id: TaskId) -> Result<PipelineTask, DatabaseError> {
        self.task(id)
            .await?
            .ok_or_else(|| DatabaseError::task_not_found(id))
    }
}
