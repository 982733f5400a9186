//! Durable work queue abstraction with visibility-timeout semantics.
//!
//! A dequeued message stays invisible to other consumers for its visibility
//! timeout; holders renew the lease to keep ownership and delete the message
//! to acknowledge it. Backends: in-memory (single process, tests) and Redis
//! (distributed, behind the `redis-backend` feature).

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryQueueBackend;
#[cfg(feature = "redis-backend")]
pub use redis::RedisQueueBackend;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from queue backend operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown receipt handle for message {0}")]
    ReceiptNotFound(String),
    #[error("{0}")]
    Backend(String),
}

/// Identifies one delivery of one message.
///
/// The receipt changes on redelivery, so a stale handle from an expired
/// lease can no longer delete or renew the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub id: String,
    pub receipt: String,
}

/// One dequeued message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub handle: MessageHandle,
    pub body: String,
}

/// A queue that hands out leased messages.
///
/// The backend is bound to one input queue; `send` targets arbitrary named
/// queues so completion results can go wherever the task asked for.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Fetch up to `max_messages` visible messages, hiding each for
    /// `visibility_timeout`. Waits up to `wait` for the first message
    /// before returning empty.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Extend a leased message's invisibility window.
    async fn extend_visibility(
        &self,
        handle: &MessageHandle,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Acknowledge (permanently remove) a leased message.
    async fn delete(&self, handle: &MessageHandle) -> Result<(), QueueError>;

    /// Append a message to a named queue, creating it if needed.
    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError>;
}
