//! Worker side of the pipeline: per-thread listeners pulling dispatch
//! requests and running them through a dispatcher.
//!
//! - `listener` — poll loop per worker thread, cooperative shutdown
//! - `dispatcher` — lifecycle of one dispatch request
//! - `context` — per-thread state and the published status registry
//! - `memory_gate` — memory admission control shared by all threads
//! - `task_log` — per-attempt log files
//! - `recovery` — repair of tasks left `PROCESSING` by a crashed process
//! - `process` — startup recovery plus the listener group

pub mod context;
pub mod dispatcher;
pub mod listener;
pub mod memory_gate;
pub mod process;
pub mod recovery;
pub mod task_log;

pub use context::{ThreadContextRegistry, ThreadState, WorkerStatus, WorkerThreadContext};
pub use dispatcher::{DispatcherDeps, DispatcherSettings, WorkerTaskDispatcher};
pub use listener::TaskRequestListener;
pub use memory_gate::{MemoryGate, MemoryReservation};
pub use process::WorkerProcess;
pub use recovery::{
    ClearStaleStateResults, clear_stale_task_states, recover, resubmit_waiting_tasks,
};
