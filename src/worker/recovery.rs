//! Startup recovery for tasks abandoned by a crashed worker on this host.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::messaging::WorkerTaskRequest;
use crate::pipeline::model::{InstanceId, TaskId, TaskState};
use crate::pipeline::{PipelineExecutor, TransitionOutbox};
use crate::store::PipelineStore;

/// Outcome of [`clear_stale_task_states`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearStaleStateResults {
    pub total_updated_task_count: usize,
    pub unique_instance_ids: BTreeSet<InstanceId>,
}

/// Mark every task still `PROCESSING` on `host` as `ERROR`.
///
/// Runs in a single transaction. Nobody else can be running those tasks: the
/// host's previous worker process is gone and this one has not started its
/// listeners yet.
pub async fn clear_stale_task_states(
    store: &dyn PipelineStore,
    host: &str,
) -> Result<ClearStaleStateResults> {
    let mut tx = store.begin().await?;
    let stale = tx.processing_tasks_on_host(host).await?;

    let mut results = ClearStaleStateResults::default();
    let now = Utc::now();
    for mut task in stale {
        warn!(task_id = %task.id, instance_id = %task.instance_id, host, "Clearing stale PROCESSING task");
        task.state = TaskState::Error;
        task.end_processing_time = Some(now);
        if let Some(record) = task.exec_log.last_mut() {
            if record.final_state.is_none() {
                record.end_processing_time = Some(now);
                record.final_state = Some(TaskState::Error);
                record.final_processing_state = Some(task.attributes.state);
            }
        }
        tx.save_task(&task).await?;
        results.total_updated_task_count += 1;
        results.unique_instance_ids.insert(task.instance_id);
    }

    tx.commit().await?;
    Ok(results)
}

/// Clear stale tasks, then refresh stage counts and aggregate state of
/// every affected instance.
pub async fn recover(
    store: &dyn PipelineStore,
    executor: &PipelineExecutor,
    host: &str,
) -> Result<ClearStaleStateResults> {
    let results = clear_stale_task_states(store, host).await?;
    if results.total_updated_task_count == 0 {
        info!(host, "No stale tasks found");
        return Ok(results);
    }

    let mut tx = store.begin().await?;
    let mut events = Vec::new();
    for &instance_id in &results.unique_instance_ids {
        for stage in tx.stages_for_instance(instance_id).await? {
            executor.update_task_counts(tx.as_mut(), stage.id).await?;
        }
        let (_, finish) = executor.update_instance_state(tx.as_mut(), instance_id).await?;
        events.extend(finish);
    }
    tx.commit().await?;

    let outbox = TransitionOutbox {
        requests: Vec::new(),
        events,
    };
    executor.send(outbox).await?;

    info!(
        host,
        tasks = results.total_updated_task_count,
        instances = results.unique_instance_ids.len(),
        "Recovered stale task state"
    );
    Ok(results)
}

/// Queue a fresh request for `SUBMITTED` tasks whose request was lost,
/// either all of them (`only` is `None`) or those listed in `only`.
///
/// Returns how many requests were sent.
pub async fn resubmit_waiting_tasks(
    store: &dyn PipelineStore,
    executor: &PipelineExecutor,
    only: Option<&HashSet<TaskId>>,
) -> Result<usize> {
    let mut tx = store.begin().await?;
    let waiting = tx.submitted_tasks().await?;

    let mut priorities: HashMap<InstanceId, u8> = HashMap::new();
    let mut outbox = TransitionOutbox::default();
    for task in waiting {
        if only.is_some_and(|ids| !ids.contains(&task.id)) {
            continue;
        }
        let priority = match priorities.get(&task.instance_id) {
            Some(&priority) => priority,
            None => {
                let priority = tx.require_instance(task.instance_id).await?.priority;
                priorities.insert(task.instance_id, priority);
                priority
            }
        };
        warn!(task_id = %task.id, instance_id = %task.instance_id, "Resubmitting waiting task");
        outbox.requests.push(WorkerTaskRequest {
            instance_id: task.instance_id,
            task_id: task.id,
            stage_id: task.stage_id,
            priority,
            transition_only: false,
        });
    }
    tx.rollback().await?;

    let count = outbox.requests.len();
    executor.send(outbox).await?;
    Ok(count)
}
