//! Priority-ordered pull over the per-priority dispatch queues.

use std::sync::Arc;

use tracing::warn;

use crate::error::QueueError;
use crate::messaging::broker::{Delivery, MessageBroker};
use crate::messaging::messages::task_request_queue_name;
use crate::pipeline::model::{HIGHEST_PRIORITY, LOWEST_PRIORITY};

/// Pulls the next dispatch request, draining higher priorities first.
pub struct PriorityQueuePool {
    broker: Arc<dyn MessageBroker>,
    /// Queue names ordered from highest to lowest priority.
    queue_names: Vec<String>,
}

impl PriorityQueuePool {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        let queue_names = (HIGHEST_PRIORITY..=LOWEST_PRIORITY)
            .map(task_request_queue_name)
            .collect();
        Self {
            broker,
            queue_names,
        }
    }

    pub fn queue_names(&self) -> &[String] {
        &self.queue_names
    }

    /// One non-blocking receive per level, highest priority first.
    ///
    /// Redelivered messages belong to an attempt that died before
    /// acknowledging; they are acknowledged and dropped here, and the scan
    /// continues on the same level. Returns `None` when every level is empty.
    pub async fn get_next_message(&self) -> Result<Option<Delivery>, QueueError> {
        for queue in &self.queue_names {
            while let Some(delivery) = self.broker.receive_no_wait(queue).await? {
                if delivery.is_redelivered() {
                    let request = delivery.request();
                    warn!(
                        queue = %queue,
                        instance_id = %request.instance_id,
                        task_id = %request.task_id,
                        "Discarding redelivered task request"
                    );
                    delivery.commit().await?;
                    continue;
                }
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }
}
