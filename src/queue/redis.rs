//! Redis-backed queue for distributed multi-worker coordination.
//!
//! Messages live in a sorted set scored by visible-at time, with bodies and
//! receipts in companion hashes. Lease operations run as atomic Lua scripts
//! so concurrent workers never double-claim a delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use super::{MessageHandle, QueueBackend, QueueError, QueueMessage};

/// Key prefix for queue data in Redis.
const KEY_PREFIX: &str = "shelfcrawl:queue:";
/// Poll cadence while waiting out a long poll.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redis-backed queue bound to one input queue.
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    input_queue: String,
}

impl RedisQueueBackend {
    /// Connect to Redis and bind to `input_queue`.
    pub async fn new(redis_url: &str, input_queue: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Unavailable(format!("Redis connection error: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Unavailable(format!("Redis connection manager error: {}", e)))?;
        Ok(Self {
            conn,
            input_queue: input_queue.to_string(),
        })
    }

    fn queue_key(queue: &str) -> String {
        format!("{}{}", KEY_PREFIX, queue)
    }

    fn bodies_key(queue: &str) -> String {
        format!("{}{}:bodies", KEY_PREFIX, queue)
    }

    fn receipts_key(queue: &str) -> String {
        format!("{}{}:receipts", KEY_PREFIX, queue)
    }

    async fn receive_once(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        // Atomically claim up to `max` visible messages: bump their score to
        // now + timeout and rotate their receipts.
        let script = Script::new(
            r#"
            local queue = KEYS[1]
            local bodies = KEYS[2]
            local receipts = KEYS[3]
            local now = tonumber(ARGV[1])
            local hidden_until = tonumber(ARGV[2])
            local max = tonumber(ARGV[3])
            local receipt_base = ARGV[4]

            local ids = redis.call('ZRANGEBYSCORE', queue, '-inf', now, 'LIMIT', 0, max)
            local result = {}
            for i, id in ipairs(ids) do
                local receipt = receipt_base .. ':' .. i
                redis.call('ZADD', queue, hidden_until, id)
                redis.call('HSET', receipts, id, receipt)
                local body = redis.call('HGET', bodies, id)
                result[#result + 1] = id
                result[#result + 1] = receipt
                result[#result + 1] = body
            end
            return result
            "#,
        );

        let now_ms = Utc::now().timestamp_millis();
        let hidden_until = now_ms + visibility_timeout.as_millis() as i64;
        let mut conn = self.conn.clone();
        let raw: Vec<String> = script
            .key(Self::queue_key(&self.input_queue))
            .key(Self::bodies_key(&self.input_queue))
            .key(Self::receipts_key(&self.input_queue))
            .arg(now_ms)
            .arg(hidden_until)
            .arg(max_messages)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(raw
            .chunks(3)
            .filter(|chunk| chunk.len() == 3)
            .map(|chunk| QueueMessage {
                handle: MessageHandle {
                    id: chunk[0].clone(),
                    receipt: chunk[1].clone(),
                },
                body: chunk[2].clone(),
            })
            .collect())
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let received = self.receive_once(max_messages, visibility_timeout).await?;
            if !received.is_empty() || tokio::time::Instant::now() >= deadline {
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
        let script = Script::new(
            r#"
            local queue = KEYS[1]
            local receipts = KEYS[2]
            if redis.call('HGET', receipts, ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('ZADD', queue, 'XX', ARGV[3], ARGV[1])
            return 1
            "#,
        );

        let hidden_until = Utc::now().timestamp_millis() + timeout.as_millis() as i64;
        let mut conn = self.conn.clone();
        let updated: i32 = script
            .key(Self::queue_key(&self.input_queue))
            .key(Self::receipts_key(&self.input_queue))
            .arg(&handle.id)
            .arg(&handle.receipt)
            .arg(hidden_until)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if updated == 0 {
            return Err(QueueError::ReceiptNotFound(handle.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), QueueError> {
        let script = Script::new(
            r#"
            local queue = KEYS[1]
            local bodies = KEYS[2]
            local receipts = KEYS[3]
            if redis.call('HGET', receipts, ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('ZREM', queue, ARGV[1])
            redis.call('HDEL', bodies, ARGV[1])
            redis.call('HDEL', receipts, ARGV[1])
            return 1
            "#,
        );

        let mut conn = self.conn.clone();
        let removed: i32 = script
            .key(Self::queue_key(&self.input_queue))
            .key(Self::bodies_key(&self.input_queue))
            .key(Self::receipts_key(&self.input_queue))
            .arg(&handle.id)
            .arg(&handle.receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if removed == 0 {
            return Err(QueueError::ReceiptNotFound(handle.id.clone()));
        }
        Ok(())
    }

    async fn send(&self, queue: &str, body: String) -> Result<(), QueueError> {
        let id = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        redis::pipe()
            .zadd(Self::queue_key(queue), &id, now_ms)
            .hset(Self::bodies_key(queue), &id, body)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }
}
