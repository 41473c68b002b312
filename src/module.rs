//! Domain modules: the pluggable processing step run for each task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::ModuleError;
use crate::filestore::FileTransaction;
use crate::pipeline::model::{PipelineInstance, PipelineTask};
use crate::worker::context::ThreadMetrics;

/// A processing step selected by a stage's module name.
///
/// One value is created per dispatch attempt. `process` may be called for a
/// task that already ran some of its steps; returning `Ok(false)` means more
/// steps remain and the task will be dispatched again.
#[async_trait]
pub trait PipelineModule: Send + Sync {
    /// Registry name of the module.
    fn name(&self) -> &str;

    /// Prepare for processing `task`. Called before `process`.
    async fn initialize(&mut self, _task: &PipelineTask) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Run the task (or its next step). Artifacts go through `files`.
    async fn process(
        &mut self,
        instance: &PipelineInstance,
        task: &mut PipelineTask,
        files: &FileTransaction,
    ) -> Result<bool, ModuleError>;

    /// Whether the finished task should be recorded as `PARTIAL`.
    fn is_partial_success(&self) -> bool {
        false
    }

    /// Stop the pipeline after this task instead of running transition logic.
    fn is_halt_pipeline_on_task_completion(&self) -> bool {
        false
    }

    /// Fold timings for this attempt into the task's summary metrics.
    fn update_metrics(&self, task: &mut PipelineTask, metrics: &ThreadMetrics, elapsed_ms: u64) {
        task.summary_metrics
            .insert("processing_ms".to_string(), elapsed_ms as f64);
        for (name, value) in metrics.iter() {
            task.summary_metrics.insert(name.to_string(), value as f64);
        }
    }
}

/// Creates a fresh module per attempt.
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn PipelineModule> + Send + Sync>;

/// Registry of available modules, keyed by name.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory. Replaces any factory with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn PipelineModule> + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self
            .factories
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.clone(), Arc::new(factory));
        if previous.is_some() {
            tracing::warn!(module = %name, "Replaced module registration");
        } else {
            tracing::debug!(module = %name, "Registered module");
        }
    }

    /// Instantiate the module registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn PipelineModule>, ModuleError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::NotRegistered {
                name: name.to_string(),
            })?;
        Ok(factory())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
