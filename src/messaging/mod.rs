//! Dispatch queues and pipeline events.
//!
//! - `messages` — task requests and lifecycle events
//! - `broker` — `MessageBroker` trait, acknowledgeable deliveries, in-memory broker
//! - `redis_broker` — broker shared across hosts through Redis lists and pub/sub
//! - `queue_pool` — priority-ordered pull across the dispatch queues

pub mod broker;
pub mod messages;
pub mod queue_pool;
pub mod redis_broker;

pub use broker::{Delivery, InMemoryBroker, MessageBroker};
pub use messages::{PipelineEventKind, PipelineInstanceEvent, WorkerTaskRequest};
pub use queue_pool::PriorityQueuePool;
pub use redis_broker::RedisBroker;
