//! Messages exchanged between launchers and workers.

use serde::{Deserialize, Serialize};

use crate::pipeline::model::{InstanceId, StageId, TaskId};

/// Prefix of the per-priority dispatch queues.
pub const TASK_REQUEST_QUEUE_PREFIX: &str = "worker-task-requests";

/// Name of the dispatch queue for one priority level.
pub fn task_request_queue_name(priority: u8) -> String {
    format!("{TASK_REQUEST_QUEUE_PREFIX}-{priority}")
}

/// Request for a worker to run (or finish transitioning) one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTaskRequest {
    pub instance_id: InstanceId,
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub priority: u8,
    /// Skip the module and only run transition logic.
    #[serde(default)]
    pub transition_only: bool,
}

impl WorkerTaskRequest {
    pub fn queue_name(&self) -> String {
        task_request_queue_name(self.priority)
    }
}

/// Lifecycle events published for orchestration callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineEventKind {
    Start,
    Finish,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInstanceEvent {
    pub kind: PipelineEventKind,
    pub instance_id: InstanceId,
    pub priority: u8,
}

impl PipelineInstanceEvent {
    pub fn new(kind: PipelineEventKind, instance_id: InstanceId, priority: u8) -> Self {
        Self {
            kind,
            instance_id,
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_follow_priority() {
        assert_eq!(task_request_queue_name(0), "worker-task-requests-0");
        let request = WorkerTaskRequest {
            instance_id: InstanceId(1),
            task_id: TaskId(2),
            stage_id: StageId(3),
            priority: 4,
            transition_only: false,
        };
        assert_eq!(request.queue_name(), "worker-task-requests-4");
    }

    #[test]
    fn request_defaults_transition_only() {
        let json = r#"{"instance_id":1,"task_id":2,"stage_id":3,"priority":0}"#;
        let request: WorkerTaskRequest = serde_json::from_str(json).unwrap();
        assert!(!request.transition_only);
        assert_eq!(request.task_id, TaskId(2));
    }

    #[test]
    fn event_kind_serializes_upper_case() {
        let event = PipelineInstanceEvent::new(PipelineEventKind::Failure, InstanceId(9), 1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "FAILURE");
    }
}
