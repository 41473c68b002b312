//! Per-attempt task log files.
//!
//! Every dispatch attempt gets its own file, `{instance}-{task}-{step}.log`,
//! under the configured directory. Events emitted while the attempt runs are
//! routed to that file (and to stderr) by a scoped subscriber.

use std::path::{Path, PathBuf};

use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::error::DispatchError;
use crate::pipeline::model::{InstanceId, TaskId};

/// File name of the log for one attempt.
pub fn task_log_file_name(instance_id: InstanceId, task_id: TaskId, step: usize) -> String {
    format!("{instance_id}-{task_id}-{step}.log")
}

/// An open per-attempt log sink.
pub struct TaskLog {
    path: PathBuf,
    dispatch: Dispatch,
    guard: Option<WorkerGuard>,
}

impl TaskLog {
    /// Create the log file and the subscriber writing to it.
    pub fn open(
        dir: &Path,
        instance_id: InstanceId,
        task_id: TaskId,
        step: usize,
    ) -> Result<Self, DispatchError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| DispatchError::TaskLog(format!("{}: {e}", dir.display())))?;

        let name = task_log_file_name(instance_id, task_id, step);
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(name.trim_end_matches(".log"))
            .filename_suffix("log")
            .build(dir)
            .map_err(|e| DispatchError::TaskLog(e.to_string()))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false),
            );

        Ok(Self {
            path: dir.join(name),
            dispatch: Dispatch::new(subscriber),
            guard: Some(guard),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscriber to attach to the attempt's future.
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }

    /// Flush buffered lines and close the file.
    pub fn close(mut self) {
        // Dropping the guard joins the background writer
        self.guard.take();
    }
}
