//! In-memory queue backend for single-process operation and tests.
//!
//! Implements the full visibility-timeout protocol so runner behavior under
//! lease expiry and redelivery can be exercised without a broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{MessageHandle, QueueBackend, QueueError, QueueMessage};

/// Poll cadence while waiting for a message during a long poll.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: String,
    /// Hidden from consumers until this instant.
    visible_at: Instant,
    /// Receipt of the latest delivery; stale receipts are rejected.
    receipt: Option<String>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    receive_calls: u64,
    extensions: HashMap<String, u32>,
}

/// In-memory multi-queue broker bound to one input queue.
#[derive(Clone)]
pub struct MemoryQueueBackend {
    input_queue: String,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryQueueBackend {
    pub fn new(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Number of `receive` calls made so far. Introspection for tests.
    pub async fn receive_calls(&self) -> u64 {
        self.state.lock().await.receive_calls
    }

    /// How many times a message's lease has been extended.
    pub async fn extension_count(&self, message_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .extensions
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot the bodies currently in a named queue.
    pub async fn peek(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Total messages remaining in a named queue (visible or leased).
    pub async fn len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.messages.len()).unwrap_or(0)
    }

    pub async fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).await == 0
    }

    /// How many times a message has been delivered.
    pub async fn delivery_count(&self, message_id: &str) -> u32 {
        let state = self.state.lock().await;
        state
            .queues
            .values()
            .flat_map(|q| q.messages.iter())
            .find(|m| m.id == message_id)
            .map(|m| m.delivery_count)
            .unwrap_or(0)
    }

    fn receive_visible(
        state: &mut BrokerState,
        input_queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Vec<QueueMessage> {
        let now = Instant::now();
        let queue = state.queues.entry(input_queue.to_string()).or_default();

        let mut received = Vec::new();
        for message in queue.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            message.visible_at = now + visibility_timeout;
            message.receipt = Some(receipt.clone());
            message.delivery_count += 1;
            received.push(QueueMessage {
                handle: MessageHandle {
                    id: message.id.clone(),
                    receipt,
                },
                body: message.body.clone(),
            });
        }
        received
    }

    fn find_leased<'a>(
        state: &'a mut BrokerState,
        input_queue: &str,
        handle: &MessageHandle,
    ) -> Result<&'a mut StoredMessage, QueueError> {
        let queue = state
            .queues
            .get_mut(input_queue)
            .ok_or_else(|| QueueError::ReceiptNotFound(handle.id.clone()))?;
        queue
            .messages
            .iter_mut()
            .find(|m| m.id == handle.id && m.receipt.as_deref() == Some(handle.receipt.as_str()))
            .ok_or_else(|| QueueError::ReceiptNotFound(handle.id.clone()))
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let (received, expired) = {
                let mut state = self.state.lock().await;
                state.receive_calls += 1;
                let received = Self::receive_visible(
                    &mut state,
                    &self.input_queue,
                    max_messages,
                    visibility_timeout,
                );
                let expired = Instant::now() >= deadline;
                // One long poll counts as one call, however often it spins.
                if received.is_empty() && !expired {
                    state.receive_calls -= 1;
                }
                (received, expired)
            };
            if !received.is_empty() || expired {
                return Ok(received);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn extend_visibility(
        &self,
        handle: &MessageHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let message = Self::find_leased(&mut state, &self.input_queue, handle)?;
        message.visible_at = Instant::now() + timeout;
        *state.extensions.entry(handle.id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&self.input_queue)
            .ok_or_else(|| QueueError::ReceiptNotFound(handle.id.clone()))?;
        let before = queue.messages.len();
        queue
            .messages
            .retain(|m| !(m.id == handle.id && m.receipt.as_deref() == Some(handle.receipt.as_str())));
        if queue.messages.len() == before {
            return Err(QueueError::ReceiptNotFound(handle.id.clone()));
        }
        Ok(())
    }

    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push(StoredMessage {
                id: Uuid::new_v4().to_string(),
                body,
                visible_at: Instant::now(),
                receipt: None,
                delivery_count: 0,
            });
        Ok(())
    }
}
