//! Pipeline domain.
//!
//! - `model` — instances, stages, tasks and their state machines
//! - `executor` — launch, stage transitions, aggregate state, reruns

pub mod executor;
pub mod model;

pub use executor::{PipelineExecutor, TransitionOutbox};
