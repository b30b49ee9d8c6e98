//! Redis Streams intake buffer.
//!
//! Each event is stored as a single `data` field holding the event JSON.
//!
//! ```text
//! XADD logs:stream * data {"log_id":"...","level":"ERROR",...}
//! ```
//!
//! Reads prefer redelivery over new work: the consumer's own pending entries
//! are re-claimed first (`XPENDING` + `XCLAIM`), then entries abandoned by a
//! crashed consumer (`XAUTOCLAIM`), and only then new entries
//! (`XREADGROUP ... >` with `BLOCK`).

use super::{BufferError, IntakeBuffer};
use crate::event::{BufferedMessage, LogEvent};
use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, AsyncCommands, FromRedisValue, Value as RedisValue};
use deadpool_redis::{Connection, Pool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

/// Stream field holding the serialized event
pub const DATA_FIELD: &str = "data";

/// Default idle time before another consumer's pending entry is claimed
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

/// Intake buffer backed by a Redis stream.
#[derive(Clone)]
pub struct RedisStreamBuffer {
    pool: Pool,
    stream: String,
    claim_idle: Duration,
}

impl RedisStreamBuffer {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    /// Set the idle time after which pending entries are claimed from other consumers.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    async fn connection(&self) -> Result<Connection, BufferError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            BufferError::Connection(e.to_string())
        })
    }

    /// Delivery counters of the consumer's pending entries, oldest first.
    async fn pending_counts(
        &self,
        conn: &mut Connection,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, u64)>, BufferError> {
        let reply: StreamPendingCountReply = conn
            .xpending_consumer_count(&self.stream, group, "-", "+", count, consumer)
            .await
            .map_err(command_error)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| (pending.id, pending.times_delivered as u64))
            .collect())
    }

    /// Re-claim this consumer's own unacknowledged entries.
    async fn read_own_pending(
        &self,
        conn: &mut Connection,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<BufferedMessage>, BufferError> {
        let pending = self.pending_counts(conn, group, consumer, count).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.iter().map(|(id, _)| id.as_str()).collect();
        // XCLAIM bumps the delivery counter, so the new count is one higher
        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream, group, consumer, 0, &ids)
            .await
            .map_err(command_error)?;

        let counts: HashMap<&str, u64> = pending
            .iter()
            .map(|(id, delivered)| (id.as_str(), delivered + 1))
            .collect();

        let messages: Vec<BufferedMessage> = claimed
            .ids
            .into_iter()
            .map(|entry| {
                let deliveries = counts.get(entry.id.as_str()).copied().unwrap_or(1);
                to_message(entry, deliveries)
            })
            .collect();

        debug!(
            count = messages.len(),
            consumer = %consumer,
            "Re-read pending messages"
        );
        Ok(messages)
    }

    /// Claim entries left pending by other consumers for longer than `claim_idle`.
    async fn claim_abandoned(
        &self,
        conn: &mut Connection,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<BufferedMessage>, BufferError> {
        // XAUTOCLAIM key group consumer min-idle-time start COUNT count
        let result: Result<RedisValue, _> = cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(group)
            .arg(consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await;

        let claimed = match result {
            Ok(RedisValue::Array(parts)) if parts.len() >= 2 => {
                StreamClaimReply::from_redis_value(&parts[1]).map_err(command_error)?
            }
            Ok(_) => return Ok(Vec::new()),
            Err(e) => {
                // XAUTOCLAIM needs Redis 6.2+
                debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
                return Ok(Vec::new());
            }
        };

        if claimed.ids.is_empty() {
            return Ok(Vec::new());
        }

        let counts: HashMap<String, u64> = self
            .pending_counts(conn, group, consumer, count)
            .await?
            .into_iter()
            .collect();

        info!(
            count = claimed.ids.len(),
            consumer = %consumer,
            "Claimed pending messages from idle consumers"
        );

        Ok(claimed
            .ids
            .into_iter()
            .map(|entry| {
                let deliveries = counts.get(&entry.id).copied().unwrap_or(1);
                to_message(entry, deliveries)
            })
            .collect())
    }

    async fn read_new(
        &self,
        conn: &mut Connection,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BufferedMessage>, BufferError> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(block.as_millis() as usize)
            .count(count);

        // A timed-out BLOCK replies with nil
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(command_error)?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| to_message(entry, 1))
            .collect())
    }
}

#[async_trait]
impl IntakeBuffer for RedisStreamBuffer {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn ensure_group(&self, group: &str) -> Result<(), BufferError> {
        let mut conn = self.connection().await?;

        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %self.stream, consumer_group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(stream = %self.stream, consumer_group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, consumer_group = %group, "Failed to create consumer group");
                Err(command_error(e))
            }
        }
    }

    async fn append(&self, event: &LogEvent) -> Result<String, BufferError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connection().await?;

        let id: String = conn
            .xadd(&self.stream, "*", &[(DATA_FIELD, payload.as_str())])
            .await
            .map_err(command_error)?;

        debug!(id = %id, stream = %self.stream, "Event appended");
        Ok(id)
    }

    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BufferedMessage>, BufferError> {
        let mut conn = self.connection().await?;

        let own = self.read_own_pending(&mut conn, group, consumer, max_count).await?;
        if !own.is_empty() {
            return Ok(own);
        }

        let abandoned = self.claim_abandoned(&mut conn, group, consumer, max_count).await?;
        if !abandoned.is_empty() {
            return Ok(abandoned);
        }

        self.read_new(&mut conn, group, consumer, max_count, block).await
    }

    async fn ack(&self, group: &str, message_id: &str) -> Result<(), BufferError> {
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .xack(&self.stream, group, &[message_id])
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn len(&self) -> Result<u64, BufferError> {
        let mut conn = self.connection().await?;
        conn.xlen(&self.stream).await.map_err(command_error)
    }

    async fn close(&self) -> Result<(), BufferError> {
        self.pool.close();
        info!(stream = %self.stream, "Redis connection pool closed");
        Ok(())
    }
}

fn to_message(entry: StreamId, deliveries: u64) -> BufferedMessage {
    BufferedMessage {
        payload: entry.get::<String>(DATA_FIELD),
        id: entry.id,
        deliveries,
    }
}

fn command_error(e: deadpool_redis::redis::RedisError) -> BufferError {
    BufferError::Command(e.to_string())
}
