//! Message broker interface and an in-process implementation.
//!
//! A receive hands out a [`Delivery`]. The message stays in flight until the
//! delivery is committed; a rolled-back or dropped delivery goes back to the
//! front of its queue flagged as redelivered, the way a broker treats a
//! consumer that died before acknowledging.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::messaging::messages::{PipelineInstanceEvent, WorkerTaskRequest};

/// Capacity of the pipeline-event channel per subscriber.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Queue service used for dispatch requests and pipeline events.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a request to a queue.
    async fn send(&self, queue: &str, request: WorkerTaskRequest) -> Result<(), QueueError>;

    /// Take the head of a queue without waiting. `None` if the queue is empty.
    async fn receive_no_wait(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Publish on the pipeline-events channel. Lost if nobody is subscribed.
    fn publish_event(&self, event: PipelineInstanceEvent);

    fn subscribe_events(&self) -> broadcast::Receiver<PipelineInstanceEvent>;

    /// Whether queued messages outlive the process that holds this broker.
    fn is_durable(&self) -> bool;

    /// Messages queued or in flight across `queues`.
    async fn pending(&self, queues: &[String]) -> Result<usize, QueueError>;

    /// Return deliveries this consumer held when it last stopped to their
    /// queues, flagged as redelivered, and report their requests.
    async fn recover_in_flight(
        &self,
        queues: &[String],
    ) -> Result<Vec<WorkerTaskRequest>, QueueError>;
}

/// Settles in-flight deliveries on behalf of a broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError>;

    /// Called from `Drop`, so it must not block.
    fn requeue(&self, delivery_id: Uuid);
}

/// A received message awaiting acknowledgement.
pub struct Delivery {
    id: Uuid,
    request: WorkerTaskRequest,
    redelivered: bool,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(
        id: Uuid,
        request: WorkerTaskRequest,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id,
            request,
            redelivered,
            acker: Some(acker),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &WorkerTaskRequest {
        &self.request
    }

    /// The broker handed this message out before without an acknowledgement.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the message; it will not be delivered again.
    pub async fn commit(mut self) -> Result<(), QueueError> {
        match self.acker.take() {
            Some(acker) => acker.ack(self.id).await,
            None => Ok(()),
        }
    }

    /// Return the message to its queue for redelivery.
    pub fn rollback(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.requeue(self.id);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.requeue(self.id);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

// ── In-memory broker ────────────────────────────────────────────────────

#[derive(Debug)]
struct Envelope {
    request: WorkerTaskRequest,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Envelope>>,
    in_flight: HashMap<Uuid, (String, WorkerTaskRequest)>,
}

#[derive(Default)]
struct Queues {
    state: Mutex<QueueState>,
}

impl Queues {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Acknowledger for Queues {
    async fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError> {
        match self.lock().in_flight.remove(&delivery_id) {
            Some(_) => Ok(()),
            None => Err(QueueError::AckFailed {
                id: delivery_id.to_string(),
                reason: "delivery is not in flight".into(),
            }),
        }
    }

    fn requeue(&self, delivery_id: Uuid) {
        let mut state = self.lock();
        if let Some((queue, request)) = state.in_flight.remove(&delivery_id) {
            debug!(queue = %queue, task_id = %request.task_id, "Requeueing unacknowledged delivery");
            state.queues.entry(queue).or_default().push_front(Envelope {
                request,
                redelivered: true,
            });
        }
    }
}

/// Process-local broker with FIFO queues and a broadcast event channel.
#[derive(Clone)]
pub struct InMemoryBroker {
    queues: Arc<Queues>,
    events: broadcast::Sender<PipelineInstanceEvent>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queues: Arc::new(Queues::default()),
            events,
        }
    }

    /// Messages waiting in a queue (not counting in-flight deliveries).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queues.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries handed out but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.queues.lock().in_flight.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send(&self, queue: &str, request: WorkerTaskRequest) -> Result<(), QueueError> {
        self.queues
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Envelope {
                request,
                redelivered: false,
            });
        Ok(())
    }

    async fn receive_no_wait(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let (id, envelope) = {
            let mut state = self.queues.lock();
            let Some(envelope) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            let id = Uuid::new_v4();
            state
                .in_flight
                .insert(id, (queue.to_string(), envelope.request.clone()));
            (id, envelope)
        };
        let acker: Arc<dyn Acknowledger> = self.queues.clone();
        Ok(Some(Delivery::new(
            id,
            envelope.request,
            envelope.redelivered,
            acker,
        )))
    }

    fn publish_event(&self, event: PipelineInstanceEvent) {
        if self.events.send(event.clone()).is_err() {
            debug!(instance_id = %event.instance_id, kind = ?event.kind, "Pipeline event has no subscribers");
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PipelineInstanceEvent> {
        self.events.subscribe()
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn pending(&self, queues: &[String]) -> Result<usize, QueueError> {
        let state = self.queues.lock();
        let queued: usize = queues
            .iter()
            .filter_map(|q| state.queues.get(q))
            .map(VecDeque::len)
            .sum();
        let in_flight = state
            .in_flight
            .values()
            .filter(|(queue, _)| queues.contains(queue))
            .count();
        Ok(queued + in_flight)
    }

    /// Deliveries of this broker die with their consumer; nothing to recover.
    async fn recover_in_flight(
        &self,
        _queues: &[String],
    ) -> Result<Vec<WorkerTaskRequest>, QueueError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::messages::PipelineEventKind;
    use crate::pipeline::model::{InstanceId, StageId, TaskId};

    fn request(task: i64) -> WorkerTaskRequest {
        WorkerTaskRequest {
            instance_id: InstanceId(1),
            task_id: TaskId(task),
            stage_id: StageId(1),
            priority: 0,
            transition_only: false,
        }
    }

    #[tokio::test]
    async fn fifo_within_queue() {
        let broker = InMemoryBroker::new();
        broker.send("q", request(1)).await.unwrap();
        broker.send("q", request(2)).await.unwrap();

        let first = broker.receive_no_wait("q").await.unwrap().unwrap();
        assert_eq!(first.request().task_id, TaskId(1));
        first.commit().await.unwrap();

        let second = broker.receive_no_wait("q").await.unwrap().unwrap();
        assert_eq!(second.request().task_id, TaskId(2));
        second.commit().await.unwrap();

        assert!(broker.receive_no_wait("q").await.unwrap().is_none());
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered_first() {
        let broker = InMemoryBroker::new();
        broker.send("q", request(1)).await.unwrap();
        broker.send("q", request(2)).await.unwrap();

        {
            let abandoned = broker.receive_no_wait("q").await.unwrap().unwrap();
            assert!(!abandoned.is_redelivered());
        }

        let again = broker.receive_no_wait("q").await.unwrap().unwrap();
        assert_eq!(again.request().task_id, TaskId(1));
        assert!(again.is_redelivered());
        again.commit().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn explicit_rollback_requeues() {
        let broker = InMemoryBroker::new();
        broker.send("q", request(7)).await.unwrap();
        let delivery = broker.receive_no_wait("q").await.unwrap().unwrap();
        delivery.rollback();
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn pending_counts_queued_and_in_flight() {
        let broker = InMemoryBroker::new();
        let queues = vec!["q".to_string()];
        assert!(!broker.is_durable());
        assert_eq!(broker.pending(&queues).await.unwrap(), 0);

        broker.send("q", request(1)).await.unwrap();
        broker.send("q", request(2)).await.unwrap();
        broker.send("other", request(3)).await.unwrap();
        let held = broker.receive_no_wait("q").await.unwrap().unwrap();
        assert_eq!(broker.pending(&queues).await.unwrap(), 2);

        held.commit().await.unwrap();
        assert_eq!(broker.pending(&queues).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_queue_is_empty() {
        let broker = InMemoryBroker::new();
        assert!(broker.receive_no_wait("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe_events();
        broker.publish_event(PipelineInstanceEvent::new(
            PipelineEventKind::Finish,
            InstanceId(3),
            2,
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, PipelineEventKind::Finish);
        assert_eq!(event.instance_id, InstanceId(3));
    }
}
