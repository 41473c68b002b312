//! Worker thread loop: pull dispatch requests and hand them to a dispatcher.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, Result, panic_message};
use crate::messaging::PriorityQueuePool;
use crate::worker::dispatcher::WorkerTaskDispatcher;

/// Long-running pull loop for one worker thread.
pub struct TaskRequestListener {
    pool: Arc<PriorityQueuePool>,
    dispatcher: WorkerTaskDispatcher,
    poll_interval: Duration,
    error_pause: Duration,
}

impl TaskRequestListener {
    pub fn new(
        pool: Arc<PriorityQueuePool>,
        dispatcher: WorkerTaskDispatcher,
        poll_interval: Duration,
        error_pause: Duration,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            poll_interval,
            error_pause,
        }
    }

    /// Loop until `shutdown` turns true (or its sender goes away).
    ///
    /// The flag is checked between iterations; a task that is running when
    /// shutdown is requested runs to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let thread = self.dispatcher.thread_number();
        info!(thread, "Worker thread started");
        self.dispatcher.reset().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => self.poll_interval,
                Err(e) => {
                    error!(thread, error = %e, "Worker loop iteration failed");
                    self.error_pause
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(thread, "Worker thread stopped");
    }

    /// Process at most one request. Returns whether one was found.
    async fn poll_once(&mut self) -> Result<bool> {
        let Some(delivery) = self.pool.get_next_message().await? else {
            return Ok(false);
        };
        let task_id = delivery.request().task_id;
        debug!(task_id = %task_id, "Received task request");

        match AssertUnwindSafe(self.dispatcher.process_message(delivery))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "Task request finished with an error");
                Ok(true)
            }
            Err(payload) => {
                self.dispatcher.reset().await;
                Err(DispatchError::Panicked {
                    id: task_id,
                    message: panic_message(payload.as_ref()),
                }
                .into())
            }
        }
    }
}
