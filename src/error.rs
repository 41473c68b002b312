//! Error types for the pipeline worker.

use std::any::Any;
use std::time::Duration;

use crate::pipeline::model::{InstanceId, StageId, TaskId, TaskState};

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path} line {line}: {message}")]
    ParseError {
        path: String,
        line: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relational store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl DatabaseError {
    pub fn instance_not_found(id: InstanceId) -> Self {
        Self::NotFound {
            entity: "pipeline_instance".into(),
            id: id.to_string(),
        }
    }

    pub fn stage_not_found(id: StageId) -> Self {
        Self::NotFound {
            entity: "pipeline_stage".into(),
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: TaskId) -> Self {
        Self::NotFound {
            entity: "pipeline_task".into(),
            id: id.to_string(),
        }
    }
}

/// File store errors.
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("File store unreachable: {0}")]
    Unavailable(String),

    #[error("File store transaction {id} is not active")]
    NoActiveTransaction { id: String },

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("File store still unreachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Failed to send to {queue}: {reason}")]
    SendFailed { queue: String, reason: String },

    #[error("Failed to acknowledge delivery {id}: {reason}")]
    AckFailed { id: String, reason: String },

    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors raised by domain modules or by module lookup.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("No module registered under name {name}")]
    NotRegistered { name: String },

    #[error("Module {name} failed to initialize: {reason}")]
    InitializationFailed { name: String, reason: String },

    #[error("Module {name} failed: {reason}")]
    ProcessingFailed { name: String, reason: String },

    #[error("Module {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Module {name} panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),
}

/// Errors raised while driving a task through its lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Task {id} is in state {state}, expected {expected}")]
    InvalidTaskState {
        id: TaskId,
        state: TaskState,
        expected: TaskState,
    },

    #[error("Task {id} has no execution record to close")]
    MissingExecutionRecord { id: TaskId },

    #[error("Stage {id} has no position {position} in instance {instance_id}")]
    MissingStage {
        id: StageId,
        instance_id: InstanceId,
        position: u32,
    },

    #[error("Task log error: {0}")]
    TaskLog(String),

    #[error("Transition failed for task {id}: {reason}")]
    TransitionFailed { id: TaskId, reason: String },

    #[error("Task {id} panicked: {message}")]
    Panicked { id: TaskId, message: String },
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
