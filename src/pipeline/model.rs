//! Pipeline entities: instances, stages, tasks and their state machines.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most urgent priority level. Queues are scanned from here downwards.
pub const HIGHEST_PRIORITY: u8 = 0;
/// Least urgent priority level.
pub const LOWEST_PRIORITY: u8 = 4;
/// Priority used when an operator does not pick one.
pub const DEFAULT_PRIORITY: u8 = 2;

/// Clamp an operator-supplied priority into the supported range.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY)
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identity of a pipeline instance.
    InstanceId
);
entity_id!(
    /// Identity of a stage within an instance.
    StageId
);
entity_id!(
    /// Identity of a task.
    TaskId
);

// ── Task ────────────────────────────────────────────────────────────────

/// Coarse lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created, not yet queued.
    Initialized,
    /// A dispatch request for the task has been queued.
    Submitted,
    /// A worker is executing the task.
    Processing,
    /// Main work finished successfully.
    Completed,
    /// Main work finished, the module reported partial success.
    Partial,
    /// The last attempt failed.
    Error,
}

impl TaskState {
    /// Main work has finished; a redelivery only needs to run transition logic.
    pub fn is_main_work_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial)
    }

    /// Terminal for the current attempt (may still be retried when `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Submitted => "SUBMITTED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZED" => Ok(Self::Initialized),
            "SUBMITTED" => Ok(Self::Submitted),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "PARTIAL" => Ok(Self::Partial),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Fine-grained progress of a task, independent of [`TaskState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    #[default]
    Initializing,
    Marshaling,
    Sending,
    Queued,
    Executing,
    Receiving,
    Storing,
    Complete,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Marshaling => "MARSHALING",
            Self::Sending => "SENDING",
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Receiving => "RECEIVING",
            Self::Storing => "STORING",
            Self::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZING" => Ok(Self::Initializing),
            "MARSHALING" => Ok(Self::Marshaling),
            "SENDING" => Ok(Self::Sending),
            "QUEUED" => Ok(Self::Queued),
            "EXECUTING" => Ok(Self::Executing),
            "RECEIVING" => Ok(Self::Receiving),
            "STORING" => Ok(Self::Storing),
            "COMPLETE" => Ok(Self::Complete),
            other => Err(format!("unknown processing state: {other}")),
        }
    }
}

/// Fine-grained processing state plus sub-task counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessingAttributes {
    pub state: ProcessingState,
    pub total_subtasks: u32,
    pub completed_subtasks: u32,
    pub failed_subtasks: u32,
}

/// Audit record of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    pub worker_host: String,
    pub worker_thread: u32,
    pub start_processing_time: DateTime<Utc>,
    pub end_processing_time: Option<DateTime<Utc>>,
    pub initial_state: TaskState,
    pub final_state: Option<TaskState>,
    pub initial_processing_state: ProcessingState,
    pub final_processing_state: Option<ProcessingState>,
}

impl TaskExecutionLog {
    /// Open a record for a new attempt, capturing the task's state going in.
    pub fn start(host: &str, thread: u32, task: &PipelineTask) -> Self {
        Self {
            worker_host: host.to_string(),
            worker_thread: thread,
            start_processing_time: Utc::now(),
            end_processing_time: None,
            initial_state: task.state,
            final_state: None,
            initial_processing_state: task.attributes.state,
            final_processing_state: None,
        }
    }
}

/// Opaque description of the data a task works on.
///
/// Modules interpret the payload; the engine only needs a short summary for
/// logs and status snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitOfWork(pub serde_json::Value);

impl UnitOfWork {
    const BRIEF_MAX_LEN: usize = 80;

    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// One-line summary: the `brief` field when present, else compact JSON.
    pub fn brief_state(&self) -> String {
        if let Some(brief) = self.0.get("brief").and_then(|b| b.as_str()) {
            return brief.to_string();
        }
        let mut text = self.0.to_string();
        if text.len() > Self::BRIEF_MAX_LEN {
            let mut cut = Self::BRIEF_MAX_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...");
        }
        text
    }
}

/// One unit of work within one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub stage_id: StageId,
    pub state: TaskState,
    pub worker_host: Option<String>,
    pub worker_thread: Option<u32>,
    pub software_revision: Option<String>,
    pub start_processing_time: Option<DateTime<Utc>>,
    pub end_processing_time: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub transition_complete: bool,
    /// Set by operators to steer a resumed multi-step module; cleared after
    /// every successful main step.
    pub restart_mode: Option<String>,
    pub retry: bool,
    pub exec_log: Vec<TaskExecutionLog>,
    pub uow: UnitOfWork,
    pub attributes: ProcessingAttributes,
    pub summary_metrics: BTreeMap<String, f64>,
}

impl PipelineTask {
    /// A fresh task as created by launch or transition.
    pub fn new(id: TaskId, instance_id: InstanceId, stage_id: StageId, uow: UnitOfWork) -> Self {
        Self {
            id,
            instance_id,
            stage_id,
            state: TaskState::Initialized,
            worker_host: None,
            worker_thread: None,
            software_revision: None,
            start_processing_time: None,
            end_processing_time: None,
            failure_count: 0,
            transition_complete: false,
            restart_mode: None,
            retry: false,
            exec_log: Vec::new(),
            uow,
            attributes: ProcessingAttributes::default(),
            summary_metrics: BTreeMap::new(),
        }
    }

    /// Index of the next attempt, used to key per-attempt logs.
    pub fn next_step_index(&self) -> usize {
        self.exec_log.len()
    }

    /// Milliseconds since processing started, or 0 if it never did.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.start_processing_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

// ── Stage ───────────────────────────────────────────────────────────────

/// Aggregate task counts for a stage or, summed, for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Tasks planned for the stage.
    pub total: u32,
    pub submitted: u32,
    pub completed: u32,
    pub failed: u32,
}

impl TaskCounts {
    /// Every planned task is terminal.
    pub fn is_done(&self) -> bool {
        self.completed + self.failed == self.total
    }

    /// Every planned task finished successfully.
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }

    /// Tasks submitted but not yet terminal.
    pub fn in_progress(&self) -> u32 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }

    pub fn sum<'a>(counts: impl IntoIterator<Item = &'a TaskCounts>) -> TaskCounts {
        counts.into_iter().fold(TaskCounts::default(), |acc, c| TaskCounts {
            total: acc.total + c.total,
            submitted: acc.submitted + c.submitted,
            completed: acc.completed + c.completed,
            failed: acc.failed + c.failed,
        })
    }
}

/// One pipeline step for one instance (an "instance node").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: StageId,
    pub instance_id: InstanceId,
    /// Zero-based position in the pipeline.
    pub position: u32,
    pub module_name: String,
    pub min_memory_mb: u64,
    pub start_new_uow: bool,
    pub remote_execution: bool,
    pub units_of_work: Vec<UnitOfWork>,
    pub counts: TaskCounts,
}

// ── Instance ────────────────────────────────────────────────────────────

/// Aggregate state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Initialized,
    Processing,
    /// At least one task failed; others are still running.
    ErrorsRunning,
    /// At least one task failed and nothing is left running.
    ErrorsStalled,
    Completed,
}

impl InstanceState {
    /// Derive the aggregate state from summed stage counts.
    pub fn from_counts(counts: &TaskCounts) -> Self {
        if counts.submitted == 0 {
            Self::Initialized
        } else if counts.completed == counts.total {
            Self::Completed
        } else if counts.failed > 0 && counts.failed + counts.completed == counts.submitted {
            Self::ErrorsStalled
        } else if counts.failed > 0 {
            Self::ErrorsRunning
        } else {
            Self::Processing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Processing => "PROCESSING",
            Self::ErrorsRunning => "ERRORS_RUNNING",
            Self::ErrorsStalled => "ERRORS_STALLED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZED" => Ok(Self::Initialized),
            "PROCESSING" => Ok(Self::Processing),
            "ERRORS_RUNNING" => Ok(Self::ErrorsRunning),
            "ERRORS_STALLED" => Ok(Self::ErrorsStalled),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

/// One run of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: InstanceId,
    pub name: String,
    pub priority: u8,
    pub state: InstanceState,
    pub start_processing_time: Option<DateTime<Utc>>,
    pub end_processing_time: Option<DateTime<Utc>>,
}

// ── Definitions ─────────────────────────────────────────────────────────

/// Static description of one step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub module_name: String,
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default)]
    pub start_new_uow: bool,
    #[serde(default)]
    pub remote_execution: bool,
    /// Work plan. Required for the first stage and `start_new_uow` stages.
    #[serde(default)]
    pub units_of_work: Vec<UnitOfWork>,
}

impl StageDefinition {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            min_memory_mb: 0,
            start_new_uow: false,
            remote_execution: false,
            units_of_work: Vec::new(),
        }
    }

    pub fn with_units_of_work(mut self, uows: Vec<UnitOfWork>) -> Self {
        self.units_of_work = uows;
        self
    }

    pub fn with_min_memory_mb(mut self, mb: u64) -> Self {
        self.min_memory_mb = mb;
        self
    }

    pub fn starting_new_uow(mut self) -> Self {
        self.start_new_uow = true;
        self
    }
}

/// Ordered list of stages making up a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}
