//! Pipeline orchestration: launching instances, stage transitions, aggregate
//! state and reruns.
//!
//! Operations that take an open [`StoreTransaction`] are composed by the
//! dispatcher and recovery inside their own transactions.
//! Messages they produce are collected in a [`TransitionOutbox`] and sent only
//! after the caller commits.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{DatabaseError, DispatchError, Error, QueueError, Result};
use crate::messaging::{MessageBroker, PipelineEventKind, PipelineInstanceEvent, WorkerTaskRequest};
use crate::pipeline::model::{
    InstanceId, InstanceState, PipelineDefinition, PipelineInstance, PipelineStage, PipelineTask,
    StageId, TaskCounts, TaskId, TaskState, clamp_priority,
};
use crate::store::{PipelineStore, StoreTransaction};

/// Requests and events produced inside a transaction, sent after it commits.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransitionOutbox {
    pub requests: Vec<WorkerTaskRequest>,
    pub events: Vec<PipelineInstanceEvent>,
}

impl TransitionOutbox {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.events.is_empty()
    }

    pub fn extend(&mut self, other: TransitionOutbox) {
        self.requests.extend(other.requests);
        self.events.extend(other.events);
    }
}

fn request_for(
    instance: &PipelineInstance,
    task: &PipelineTask,
    transition_only: bool,
) -> WorkerTaskRequest {
    WorkerTaskRequest {
        instance_id: instance.id,
        task_id: task.id,
        stage_id: task.stage_id,
        priority: instance.priority,
        transition_only,
    }
}

/// Creates and advances pipeline instances.
pub struct PipelineExecutor {
    store: Arc<dyn PipelineStore>,
    broker: Arc<dyn MessageBroker>,
}

impl PipelineExecutor {
    pub fn new(store: Arc<dyn PipelineStore>, broker: Arc<dyn MessageBroker>) -> Self {
        Self { store, broker }
    }

    // ── Launch ──────────────────────────────────────────────────────

    /// Create an instance of `definition` and queue its first-stage tasks.
    pub async fn launch(
        &self,
        definition: &PipelineDefinition,
        name: &str,
        priority: u8,
    ) -> Result<PipelineInstance> {
        let Some(first) = definition.stages.first() else {
            return Err(Error::InvalidDefinition(format!(
                "pipeline {} has no stages",
                definition.name
            )));
        };
        if first.units_of_work.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "first stage {} of pipeline {} has no units of work",
                first.module_name, definition.name
            )));
        }

        let priority = clamp_priority(priority);
        let mut tx = self.store.begin().await?;

        let mut instance = tx.create_instance(name, priority).await?;
        instance.state = InstanceState::Processing;
        instance.start_processing_time = Some(Utc::now());
        tx.save_instance(&instance).await?;

        let mut stages: Vec<PipelineStage> = Vec::with_capacity(definition.stages.len());
        for (position, stage_def) in definition.stages.iter().enumerate() {
            let total = match stages.last() {
                Some(previous) if !stage_def.start_new_uow => previous.counts.total,
                _ => stage_def.units_of_work.len() as u32,
            };
            let stage = tx
                .create_stage(instance.id, position as u32, stage_def, total)
                .await?;
            stages.push(stage);
        }

        let mut outbox = TransitionOutbox::default();
        let first_stage = &mut stages[0];
        outbox
            .requests
            .extend(submit_stage_tasks(tx.as_mut(), &instance, first_stage).await?);
        outbox.events.push(PipelineInstanceEvent::new(
            PipelineEventKind::Start,
            instance.id,
            instance.priority,
        ));

        tx.commit().await?;
        info!(
            instance_id = %instance.id,
            pipeline = %definition.name,
            priority = instance.priority,
            tasks = outbox.requests.len(),
            "Launched pipeline instance"
        );
        self.send(outbox).await?;
        Ok(instance)
    }

    // ── Transition logic ────────────────────────────────────────────

    /// Recompute a stage's counts from its tasks, holding the stage lock.
    pub async fn update_task_counts(
        &self,
        tx: &mut dyn StoreTransaction,
        stage_id: StageId,
    ) -> std::result::Result<PipelineStage, DatabaseError> {
        let mut stage = tx
            .lock_stage(stage_id)
            .await?
            .ok_or_else(|| DatabaseError::stage_not_found(stage_id))?;
        let tasks = tx.tasks_for_stage(stage_id).await?;

        let mut counts = TaskCounts {
            total: stage.counts.total,
            submitted: tasks.len() as u32,
            ..TaskCounts::default()
        };
        for task in &tasks {
            match task.state {
                TaskState::Completed | TaskState::Partial => counts.completed += 1,
                TaskState::Error => counts.failed += 1,
                _ => {}
            }
        }

        if counts != stage.counts {
            debug!(
                stage_id = %stage_id,
                total = counts.total,
                submitted = counts.submitted,
                completed = counts.completed,
                failed = counts.failed,
                "Updated stage task counts"
            );
            stage.counts = counts;
            tx.save_stage(&stage).await?;
        }
        Ok(stage)
    }

    /// Create the follow-on work for a successfully finished task.
    ///
    /// `current` must carry counts already refreshed by
    /// [`update_task_counts`](Self::update_task_counts) in the same
    /// transaction.
    pub async fn do_transition(
        &self,
        tx: &mut dyn StoreTransaction,
        instance: &PipelineInstance,
        current: &PipelineStage,
        task: &PipelineTask,
    ) -> std::result::Result<TransitionOutbox, DatabaseError> {
        let mut outbox = TransitionOutbox::default();
        let next_id = tx
            .stages_for_instance(instance.id)
            .await?
            .into_iter()
            .find(|s| s.position == current.position + 1)
            .map(|s| s.id);
        let Some(next_id) = next_id else {
            info!(task_id = %task.id, stage = current.position, "End of pipeline reached for this unit of work");
            return Ok(outbox);
        };

        let mut next = tx
            .lock_stage(next_id)
            .await?
            .ok_or_else(|| DatabaseError::stage_not_found(next_id))?;

        if next.start_new_uow {
            if !current.counts.is_complete() {
                info!(
                    task_id = %task.id,
                    completed = current.counts.completed,
                    total = current.counts.total,
                    "Stage has unfinished tasks, next stage waits"
                );
                return Ok(outbox);
            }
            if next.counts.submitted > 0 {
                debug!(stage_id = %next.id, "Next stage already launched");
                return Ok(outbox);
            }
            info!(stage_id = %next.id, module = %next.module_name, "Stage complete, launching next stage");
            outbox
                .requests
                .extend(submit_stage_tasks(tx, instance, &mut next).await?);
        } else {
            let mut next_task = tx.create_task(instance.id, next.id, &task.uow).await?;
            next_task.state = TaskState::Submitted;
            tx.save_task(&next_task).await?;
            next.counts.submitted += 1;
            tx.save_stage(&next).await?;
            info!(
                task_id = %task.id,
                next_task_id = %next_task.id,
                module = %next.module_name,
                "Created next-stage task with the same unit of work"
            );
            outbox.requests.push(request_for(instance, &next_task, false));
        }
        Ok(outbox)
    }

    /// Derive and persist the instance's aggregate state from its stages.
    ///
    /// Returns the updated instance and, when it has just completed, the
    /// `FINISH` event to publish after commit.
    pub async fn update_instance_state(
        &self,
        tx: &mut dyn StoreTransaction,
        instance_id: InstanceId,
    ) -> std::result::Result<(PipelineInstance, Option<PipelineInstanceEvent>), DatabaseError>
    {
        let mut instance = tx
            .lock_instance(instance_id)
            .await?
            .ok_or_else(|| DatabaseError::instance_not_found(instance_id))?;
        let stages = tx.stages_for_instance(instance_id).await?;
        let counts = TaskCounts::sum(stages.iter().map(|s| &s.counts));

        let previous = instance.state;
        let state = InstanceState::from_counts(&counts);
        let mut event = None;
        if state != previous {
            instance.state = state;
            match state {
                InstanceState::Completed => {
                    instance.end_processing_time = Some(Utc::now());
                    event = Some(PipelineInstanceEvent::new(
                        PipelineEventKind::Finish,
                        instance.id,
                        instance.priority,
                    ));
                }
                InstanceState::ErrorsStalled => {
                    instance.end_processing_time = Some(Utc::now());
                }
                _ => {}
            }
            tx.save_instance(&instance).await?;
        }

        info!(
            instance_id = %instance_id,
            total = counts.total,
            submitted = counts.submitted,
            completed = counts.completed,
            failed = counts.failed,
            state = %instance.state,
            "Updated instance state"
        );
        Ok((instance, event))
    }

    /// Take one failure off a stage's failed counter.
    pub async fn decrement_failed_count(
        &self,
        tx: &mut dyn StoreTransaction,
        stage_id: StageId,
    ) -> std::result::Result<(), DatabaseError> {
        let mut stage = tx
            .lock_stage(stage_id)
            .await?
            .ok_or_else(|| DatabaseError::stage_not_found(stage_id))?;
        stage.counts.failed = stage.counts.failed.saturating_sub(1);
        tx.save_stage(&stage).await
    }

    // ── Reruns ──────────────────────────────────────────────────────

    /// Resubmit a task in `ERROR`.
    pub async fn rerun_failed_task(&self, task_id: TaskId, transition_only: bool) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut task = tx.require_task(task_id).await?;
        if task.state != TaskState::Error {
            tx.rollback().await?;
            return Err(DispatchError::InvalidTaskState {
                id: task_id,
                state: task.state,
                expected: TaskState::Error,
            }
            .into());
        }

        task.state = TaskState::Submitted;
        task.start_processing_time = None;
        task.end_processing_time = None;
        task.retry = true;
        tx.save_task(&task).await?;
        self.decrement_failed_count(tx.as_mut(), task.stage_id).await?;
        let (instance, event) = self
            .update_instance_state(tx.as_mut(), task.instance_id)
            .await?;
        tx.commit().await?;

        info!(task_id = %task_id, transition_only, "Resubmitting failed task");
        let mut outbox = TransitionOutbox::default();
        outbox.events.extend(event);
        outbox.extend(rerun_outbox(&instance, &task, transition_only));
        self.send(outbox).await?;
        Ok(())
    }

    /// Send a fresh dispatch request for any task, whatever its state.
    pub async fn rerun_task(&self, task_id: TaskId, transition_only: bool) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let task = tx.require_task(task_id).await?;
        let instance = tx.require_instance(task.instance_id).await?;
        tx.rollback().await?;

        info!(task_id = %task_id, state = %task.state, transition_only, "Resending task request");
        self.send(rerun_outbox(&instance, &task, transition_only))
            .await?;
        Ok(())
    }

    /// Deliver an outbox: queue the requests, publish the events.
    pub async fn send(&self, outbox: TransitionOutbox) -> std::result::Result<(), QueueError> {
        for request in outbox.requests {
            self.broker.send(&request.queue_name(), request).await?;
        }
        for event in outbox.events {
            self.broker.publish_event(event);
        }
        Ok(())
    }
}

/// The request for a rerun plus the `START` event that wakes up workers.
fn rerun_outbox(
    instance: &PipelineInstance,
    task: &PipelineTask,
    transition_only: bool,
) -> TransitionOutbox {
    TransitionOutbox {
        requests: vec![request_for(instance, task, transition_only)],
        events: vec![PipelineInstanceEvent::new(
            PipelineEventKind::Start,
            instance.id,
            instance.priority,
        )],
    }
}

/// Create `SUBMITTED` tasks for every unit of work in the stage's plan.
async fn submit_stage_tasks(
    tx: &mut dyn StoreTransaction,
    instance: &PipelineInstance,
    stage: &mut PipelineStage,
) -> std::result::Result<Vec<WorkerTaskRequest>, DatabaseError> {
    let mut requests = Vec::with_capacity(stage.units_of_work.len());
    for uow in &stage.units_of_work {
        let mut task = tx.create_task(instance.id, stage.id, uow).await?;
        task.state = TaskState::Submitted;
        tx.save_task(&task).await?;
        requests.push(request_for(instance, &task, false));
    }
    stage.counts.submitted = requests.len() as u32;
    tx.save_stage(stage).await?;
    Ok(requests)
}
