//! Redis-backed broker with reliable dequeue.
//!
//! Every dispatch queue is a Redis list shared by all worker hosts:
//!
//! - `{prefix}:{queue}`: waiting messages, pushed on the left, popped on the right
//! - `{prefix}:{queue}:processing:{host}`: messages this host has received but
//!   not yet acknowledged
//! - `{prefix}:{queue}:dead_letter`: payloads that could not be decoded
//!
//! A receive moves the message into the host's processing list with
//! `RPOPLPUSH`, so a crash never loses it. An acknowledgement removes it
//! there; a requeue moves it back to the head of its queue flagged as
//! redelivered. On startup [`MessageBroker::recover_in_flight`] does the same
//! for whatever the previous process on this host was holding.
//!
//! Pipeline events travel over a pub/sub channel and are fanned out to local
//! subscribers through a broadcast channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::messaging::broker::{
    Acknowledger, Delivery, EVENT_CHANNEL_CAPACITY, MessageBroker,
};
use crate::messaging::messages::{PipelineInstanceEvent, WorkerTaskRequest};

/// Key prefix shared by every list and channel of this broker.
pub const DEFAULT_KEY_PREFIX: &str = "pipeline";

const EVENTS_CHANNEL: &str = "pipeline-events";

/// Pause before resubscribing after the event subscription fails.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Wire form of a queued request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    #[serde(default)]
    redelivered: bool,
    request: WorkerTaskRequest,
}

impl Envelope {
    fn new(request: WorkerTaskRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            redelivered: false,
            request,
        }
    }

    fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Redis key names for one queue as seen from one host.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    queue: String,
    processing: String,
    dead_letter: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str, host: &str) -> Self {
        let queue = format!("{prefix}:{queue}");
        Self {
            processing: format!("{queue}:processing:{host}"),
            dead_letter: format!("{queue}:dead_letter"),
            queue,
        }
    }
}

/// A message held by this host.
#[derive(Debug, Clone)]
struct InFlight {
    keys: QueueKeys,
    raw: String,
}

/// Move `raw` from the processing list back to the head of its queue,
/// flagged as redelivered.
async fn requeue_entry(
    conn: &mut ConnectionManager,
    keys: &QueueKeys,
    raw: &str,
) -> Result<WorkerTaskRequest, QueueError> {
    let mut envelope = Envelope::decode(raw)?;
    envelope.redelivered = true;
    let redelivered = envelope.encode()?;

    let mut pipe = redis::pipe();
    pipe.atomic()
        .lrem(&keys.processing, 1, raw)
        .rpush(&keys.queue, redelivered);
    pipe.query_async::<_, ()>(conn).await?;
    Ok(envelope.request)
}

/// Move an undecodable payload out of the processing list.
async fn dead_letter(
    conn: &mut ConnectionManager,
    keys: &QueueKeys,
    raw: &str,
    error: &QueueError,
) -> Result<(), QueueError> {
    warn!(queue = %keys.queue, error = %error, "Moving malformed message to dead letter list");
    let entry = serde_json::json!({
        "payload": raw,
        "error": error.to_string(),
        "moved_at": chrono::Utc::now().to_rfc3339(),
    });
    let mut pipe = redis::pipe();
    pipe.atomic()
        .lrem(&keys.processing, 1, raw)
        .lpush(&keys.dead_letter, entry.to_string());
    pipe.query_async::<_, ()>(conn).await?;
    Ok(())
}

struct RedisAcknowledger {
    redis: ConnectionManager,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    requeues: mpsc::UnboundedSender<InFlight>,
}

impl RedisAcknowledger {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Acknowledger for RedisAcknowledger {
    async fn ack(&self, delivery_id: Uuid) -> Result<(), QueueError> {
        let Some(entry) = self.in_flight().remove(&delivery_id) else {
            return Err(QueueError::AckFailed {
                id: delivery_id.to_string(),
                reason: "delivery is not in flight".into(),
            });
        };
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&entry.keys.processing, 1, &entry.raw)
            .await
            .map_err(|e| QueueError::AckFailed {
                id: delivery_id.to_string(),
                reason: e.to_string(),
            })
    }

    fn requeue(&self, delivery_id: Uuid) {
        let Some(entry) = self.in_flight().remove(&delivery_id) else {
            return;
        };
        // If the requeue task is gone the entry stays in the processing list
        // and is recovered on the next start
        if self.requeues.send(entry).is_err() {
            warn!(delivery_id = %delivery_id, "Requeue worker stopped; leaving delivery for recovery");
        }
    }
}

/// Broker shared by every worker host through one Redis server.
pub struct RedisBroker {
    redis: ConnectionManager,
    prefix: String,
    host: String,
    acker: Arc<RedisAcknowledger>,
    events: broadcast::Sender<PipelineInstanceEvent>,
    outgoing_events: mpsc::UnboundedSender<PipelineInstanceEvent>,
    background: Vec<JoinHandle<()>>,
}

impl RedisBroker {
    /// Connect to `redis_url`; `host` scopes this consumer's in-flight list.
    pub async fn connect(redis_url: &str, host: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(redis_url, DEFAULT_KEY_PREFIX, host).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: &str,
        host: &str,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let channel = format!("{prefix}:{EVENTS_CHANNEL}");

        let background = vec![
            tokio::spawn(run_requeues(redis.clone(), requeue_rx)),
            tokio::spawn(run_event_publisher(
                redis.clone(),
                channel.clone(),
                outgoing_rx,
            )),
            tokio::spawn(run_event_subscriber(client, channel, events.clone())),
        ];

        info!(prefix, host, "Connected to Redis broker");
        Ok(Self {
            acker: Arc::new(RedisAcknowledger {
                redis: redis.clone(),
                in_flight: Mutex::new(HashMap::new()),
                requeues: requeue_tx,
            }),
            redis,
            prefix: prefix.to_string(),
            host: host.to_string(),
            events,
            outgoing_events: outgoing_tx,
            background,
        })
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue, &self.host)
    }

    /// Messages in a queue's dead letter list.
    pub async fn dead_letter_len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(self.keys(queue).dead_letter).await?)
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn send(&self, queue: &str, request: WorkerTaskRequest) -> Result<(), QueueError> {
        let raw = Envelope::new(request).encode()?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.keys(queue).queue, raw)
            .await
            .map_err(|e| QueueError::SendFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn receive_no_wait(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();
        loop {
            let raw: Option<String> = conn.rpoplpush(&keys.queue, &keys.processing).await?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            let envelope = match Envelope::decode(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    dead_letter(&mut conn, &keys, &raw, &e).await?;
                    continue;
                }
            };

            self.acker.in_flight().insert(
                envelope.id,
                InFlight {
                    keys: keys.clone(),
                    raw,
                },
            );
            let acker: Arc<dyn Acknowledger> = self.acker.clone();
            return Ok(Some(Delivery::new(
                envelope.id,
                envelope.request,
                envelope.redelivered,
                acker,
            )));
        }
    }

    fn publish_event(&self, event: PipelineInstanceEvent) {
        if self.outgoing_events.send(event).is_err() {
            warn!("Event publisher stopped; dropping pipeline event");
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PipelineInstanceEvent> {
        self.events.subscribe()
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn pending(&self, queues: &[String]) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut total = 0;
        for queue in queues {
            let keys = self.keys(queue);
            let queued: usize = conn.llen(&keys.queue).await?;
            let held: usize = conn.llen(&keys.processing).await?;
            total += queued + held;
        }
        Ok(total)
    }

    async fn recover_in_flight(
        &self,
        queues: &[String],
    ) -> Result<Vec<WorkerTaskRequest>, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = Vec::new();
        for queue in queues {
            let keys = self.keys(queue);
            let held: Vec<String> = conn.lrange(&keys.processing, 0, -1).await?;
            for raw in held {
                match requeue_entry(&mut conn, &keys, &raw).await {
                    Ok(request) => {
                        warn!(queue = %queue, task_id = %request.task_id, "Requeued delivery held by previous process");
                        recovered.push(request);
                    }
                    Err(e @ QueueError::Malformed(_)) => {
                        dead_letter(&mut conn, &keys, &raw, &e).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(recovered)
    }
}

async fn run_requeues(mut conn: ConnectionManager, mut rx: mpsc::UnboundedReceiver<InFlight>) {
    while let Some(entry) = rx.recv().await {
        match requeue_entry(&mut conn, &entry.keys, &entry.raw).await {
            Ok(request) => {
                debug!(queue = %entry.keys.queue, task_id = %request.task_id, "Requeued unacknowledged delivery");
            }
            Err(e) => {
                warn!(queue = %entry.keys.queue, error = %e, "Failed to requeue delivery; leaving it for recovery");
            }
        }
    }
}

async fn run_event_publisher(
    mut conn: ConnectionManager,
    channel: String,
    mut rx: mpsc::UnboundedReceiver<PipelineInstanceEvent>,
) {
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Cannot encode pipeline event");
                continue;
            }
        };
        if let Err(e) = conn.publish::<_, _, ()>(&channel, payload).await {
            warn!(instance_id = %event.instance_id, error = %e, "Failed to publish pipeline event");
        }
    }
}

async fn run_event_subscriber(
    client: redis::Client,
    channel: String,
    events: broadcast::Sender<PipelineInstanceEvent>,
) {
    loop {
        if let Err(e) = forward_events(&client, &channel, &events).await {
            warn!(error = %e, "Pipeline event subscription failed");
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn forward_events(
    client: &redis::Client,
    channel: &str,
    events: &broadcast::Sender<PipelineInstanceEvent>,
) -> Result<(), QueueError> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(channel).await?;
    let mut messages = std::pin::pin!(pubsub.on_message());
    while let Some(message) = messages.next().await {
        let payload: String = message.get_payload()?;
        match serde_json::from_str::<PipelineInstanceEvent>(&payload) {
            Ok(event) => {
                // No local subscribers is fine
                let _ = events.send(event);
            }
            Err(e) => warn!(error = %e, "Ignoring malformed pipeline event"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::messages::{PipelineEventKind, task_request_queue_name};
    use crate::pipeline::model::{InstanceId, StageId, TaskId};

    fn request(task: i64) -> WorkerTaskRequest {
        WorkerTaskRequest {
            instance_id: InstanceId(1),
            task_id: TaskId(task),
            stage_id: StageId(2),
            priority: 3,
            transition_only: false,
        }
    }

    #[test]
    fn keys_are_scoped_by_queue_and_host() {
        let keys = QueueKeys::new("pipeline", "worker-task-requests-0", "node-7");
        assert_eq!(keys.queue, "pipeline:worker-task-requests-0");
        assert_eq!(
            keys.processing,
            "pipeline:worker-task-requests-0:processing:node-7"
        );
        assert_eq!(keys.dead_letter, "pipeline:worker-task-requests-0:dead_letter");
    }

    #[test]
    fn envelope_defaults_to_first_delivery() {
        let envelope = Envelope::new(request(5));
        let raw = envelope.encode().unwrap();
        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded, envelope);
        assert!(!decoded.redelivered);

        let legacy = format!(
            r#"{{"id":"{}","request":{}}}"#,
            Uuid::new_v4(),
            serde_json::to_string(&request(6)).unwrap()
        );
        assert!(!Envelope::decode(&legacy).unwrap().redelivered);
    }

    #[test]
    fn malformed_payload_is_reported() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(QueueError::Malformed(_))
        ));
    }

    /// Runs against the server at `REDIS_URL`.
    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn reliable_queue_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let prefix = format!("test-{}", Uuid::new_v4());
        let queue = task_request_queue_name(0);
        let queues = vec![queue.clone()];

        let broker = RedisBroker::connect_with_prefix(&url, &prefix, "node-a")
            .await
            .unwrap();
        let mut events = broker.subscribe_events();
        broker.send(&queue, request(1)).await.unwrap();
        broker.send(&queue, request(2)).await.unwrap();
        assert_eq!(broker.pending(&queues).await.unwrap(), 2);

        // Acknowledged delivery is gone for good
        let first = broker.receive_no_wait(&queue).await.unwrap().unwrap();
        assert_eq!(first.request().task_id, TaskId(1));
        first.commit().await.unwrap();

        // A dropped delivery comes back first, flagged
        drop(broker.receive_no_wait(&queue).await.unwrap().unwrap());
        let again = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(d) = broker.receive_no_wait(&queue).await.unwrap() {
                    break d;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(again.request().task_id, TaskId(2));
        assert!(again.is_redelivered());
        std::mem::forget(again);

        // A restarted consumer on the same host takes back what was held
        let restarted = RedisBroker::connect_with_prefix(&url, &prefix, "node-a")
            .await
            .unwrap();
        let recovered = restarted.recover_in_flight(&queues).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].task_id, TaskId(2));
        let held = restarted.receive_no_wait(&queue).await.unwrap().unwrap();
        assert!(held.is_redelivered());
        held.commit().await.unwrap();
        assert_eq!(restarted.pending(&queues).await.unwrap(), 0);

        // Give the subscription a moment to attach
        tokio::time::sleep(Duration::from_millis(200)).await;
        restarted.publish_event(PipelineInstanceEvent::new(
            PipelineEventKind::Start,
            InstanceId(1),
            3,
        ));
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, PipelineEventKind::Start);
    }
}
