//! Per-thread worker context and the registry of published snapshots.
//!
//! Each dispatcher owns one [`WorkerThreadContext`] describing what its
//! thread is doing right now. After every change it publishes a
//! [`WorkerStatus`] snapshot into the shared [`ThreadContextRegistry`], which
//! the status endpoint reads.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::messaging::WorkerTaskRequest;
use crate::pipeline::model::{InstanceId, PipelineInstance, PipelineStage, PipelineTask, TaskId};

/// Named timings collected during one attempt, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ThreadMetrics {
    values: BTreeMap<String, u64>,
}

impl ThreadMetrics {
    /// Add `ms` to the named timer.
    pub fn add(&mut self, name: &str, ms: u64) {
        *self.values.entry(name.to_string()).or_insert(0) += ms;
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// What a worker thread is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    Idle,
    Processing,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("IDLE"),
            Self::Processing => f.write_str("PROCESSING"),
        }
    }
}

/// Mutable context of one worker thread, owned by its dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerThreadContext {
    pub thread_number: u32,
    pub host: String,
    pub state: ThreadState,
    pub request: Option<WorkerTaskRequest>,
    pub instance: Option<PipelineInstance>,
    pub task: Option<PipelineTask>,
    pub module_name: Option<String>,
    remote_execution: bool,
    pub processing_start: Option<DateTime<Utc>>,
    pub metrics: ThreadMetrics,
}

impl WorkerThreadContext {
    pub fn new(thread_number: u32, host: impl Into<String>) -> Self {
        Self {
            thread_number,
            host: host.into(),
            state: ThreadState::Idle,
            request: None,
            instance: None,
            task: None,
            module_name: None,
            remote_execution: false,
            processing_start: None,
            metrics: ThreadMetrics::default(),
        }
    }

    /// Start tracking a newly received request.
    pub fn begin(&mut self, request: WorkerTaskRequest) {
        self.reset();
        self.state = ThreadState::Processing;
        self.request = Some(request);
        self.processing_start = Some(Utc::now());
    }

    /// Record the stage the current task belongs to.
    pub fn set_stage(&mut self, stage: &PipelineStage) {
        self.module_name = Some(stage.module_name.clone());
        self.remote_execution = stage.remote_execution;
    }

    /// Whether the current task's stage is configured for remote execution.
    pub fn current_task_is_remote(&self) -> bool {
        self.task.is_some() && self.remote_execution
    }

    /// Back to idle; drops everything tied to the previous request.
    pub fn reset(&mut self) {
        self.state = ThreadState::Idle;
        self.request = None;
        self.instance = None;
        self.task = None;
        self.module_name = None;
        self.remote_execution = false;
        self.processing_start = None;
        self.metrics.clear();
    }

    pub fn snapshot(&self) -> WorkerStatus {
        let instance_id = self
            .instance
            .as_ref()
            .map(|i| i.id)
            .or_else(|| self.request.as_ref().map(|r| r.instance_id));
        let task_id = self
            .task
            .as_ref()
            .map(|t| t.id)
            .or_else(|| self.request.as_ref().map(|r| r.task_id));
        WorkerStatus {
            thread_number: self.thread_number,
            host: self.host.clone(),
            state: self.state,
            instance_id,
            task_id,
            module_name: self.module_name.clone(),
            remote: self.current_task_is_remote(),
            uow_brief: self.task.as_ref().map(|t| t.uow.brief_state()),
            processing_start: self.processing_start,
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time view of one worker thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub thread_number: u32,
    pub host: String,
    pub state: ThreadState,
    pub instance_id: Option<InstanceId>,
    pub task_id: Option<TaskId>,
    pub module_name: Option<String>,
    /// The current task runs on a remote cluster.
    pub remote: bool,
    pub uow_brief: Option<String>,
    pub processing_start: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Latest snapshot of every worker thread, keyed by thread number.
#[derive(Default)]
pub struct ThreadContextRegistry {
    statuses: RwLock<HashMap<u32, WorkerStatus>>,
}

impl ThreadContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, status: WorkerStatus) {
        self.statuses
            .write()
            .await
            .insert(status.thread_number, status);
    }

    pub async fn get(&self, thread_number: u32) -> Option<WorkerStatus> {
        self.statuses.read().await.get(&thread_number).cloned()
    }

    /// All snapshots ordered by thread number.
    pub async fn all(&self) -> Vec<WorkerStatus> {
        let mut all: Vec<WorkerStatus> = self.statuses.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.thread_number);
        all
    }

    pub async fn remove(&self, thread_number: u32) -> Option<WorkerStatus> {
        self.statuses.write().await.remove(&thread_number)
    }

    pub async fn summary(&self) -> RegistrySummary {
        let statuses = self.statuses.read().await;
        let mut summary = RegistrySummary::default();
        for status in statuses.values() {
            match status.state {
                ThreadState::Idle => summary.idle += 1,
                ThreadState::Processing => summary.processing += 1,
            }
        }
        summary.total = statuses.len();
        summary
    }
}

/// Thread counts by state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub idle: usize,
    pub processing: usize,
}
