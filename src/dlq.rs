//! Dead Letter Queue for events that cannot be delivered.
//!
//! When a message cannot be parsed, is rejected by a sink, or keeps coming
//! back without ever being settled, the worker wraps it in a
//! [`DeadLetterEntry`] and appends it here before acknowledging the original.
//! Nothing in the pipeline reads the DLQ back; operators or a separate
//! reprocessing job drain it.
//!
//! # Example
//!
//! ```rust,ignore
//! use logflow::dlq::{DeadLetterEntry, FailureReason, RedisDeadLetterQueue};
//!
//! let dlq = RedisDeadLetterQueue::new(redis_pool, "logs:failed");
//! dlq.write(&DeadLetterEntry::new(&message, FailureReason::ParseError, "expected value")).await?;
//!
//! // Later, list failed events
//! let failed = dlq.list(10, 0).await?;
//! ```

use crate::event::BufferedMessage;
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Default Redis stream name for the Dead Letter Queue
pub const DLQ_STREAM_NAME: &str = "logs:failed";

/// Maximum entries to keep in DLQ (older entries are trimmed)
const DLQ_MAX_LEN: usize = 100_000;

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Message body is not a valid event
    ParseError,
    /// The search index rejected the document
    SinkWriteError,
    /// The document store rejected the document
    DocumentStoreError,
    /// Redelivered too many times without being settled
    MaxDeliveriesExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ParseError => "parse_error",
            FailureReason::SinkWriteError => "sink_write_error",
            FailureReason::DocumentStoreError => "document_store_error",
            FailureReason::MaxDeliveriesExceeded => "max_deliveries_exceeded",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The message as it was read from the intake buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalMessage {
    pub id: String,
    pub data: Option<String>,
}

/// A failed message stored in the Dead Letter Queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub original_message: OriginalMessage,

    pub failure_reason: FailureReason,

    /// Error text from the failing component
    pub error: String,

    /// ISO 8601 timestamp when the message was dead-lettered
    pub timestamp: String,

    /// Reprocessing attempts so far; written as 0
    pub retry_count: u32,
}

impl DeadLetterEntry {
    pub fn new(message: &BufferedMessage, reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            original_message: OriginalMessage {
                id: message.id.clone(),
                data: message.payload.clone(),
            },
            failure_reason: reason,
            error: error.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            retry_count: 0,
        }
    }
}

/// Errors that can occur when writing to the Dead Letter Queue.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Append-only destination for dead-letter entries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append an entry, returning its id in the DLQ.
    async fn write(&self, entry: &DeadLetterEntry) -> Result<String, DlqError>;

    /// Number of entries currently held.
    async fn len(&self) -> Result<u64, DlqError>;
}

/// Dead Letter Queue stored in a Redis stream.
#[derive(Clone)]
pub struct RedisDeadLetterQueue {
    pool: Pool,
    stream: String,
}

impl RedisDeadLetterQueue {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DlqError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::ConnectionError(e.to_string())
        })
    }

    /// List entries in the DLQ, oldest first.
    ///
    /// Returns a list of (stream_id, entry) tuples; entries that do not
    /// decode are skipped.
    pub async fn list(
        &self,
        count: usize,
        offset: usize,
    ) -> Result<Vec<(String, DeadLetterEntry)>, DlqError> {
        let mut conn = self.connection().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        let result: Vec<(String, DeadLetterEntry)> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .filter_map(|(id, fields)| {
                let data = fields.into_iter().find(|(key, _)| key == "data")?.1;
                match serde_json::from_str(&data) {
                    Ok(entry) => Some((id, entry)),
                    Err(e) => {
                        debug!(id = %id, error = %e, "Skipping undecodable DLQ entry");
                        None
                    }
                }
            })
            .collect();

        debug!(count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterQueue {
    async fn write(&self, entry: &DeadLetterEntry) -> Result<String, DlqError> {
        let entry_json = serde_json::to_string(entry).map_err(|e| {
            error!(error = %e, "Failed to serialize DLQ entry");
            DlqError::SerializationError(e.to_string())
        })?;

        let mut conn = self.connection().await?;

        // Add to DLQ stream with MAXLEN to prevent unbounded growth
        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("data")
            .arg(&entry_json)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to add entry to DLQ");
                DlqError::RedisError(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            original_id = %entry.original_message.id,
            reason = %entry.failure_reason,
            "Message moved to Dead Letter Queue"
        );

        Ok(id)
    }

    async fn len(&self) -> Result<u64, DlqError> {
        let mut conn = self.connection().await?;

        let count: u64 = cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        Ok(count)
    }
}

/// In-memory Dead Letter Queue, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    entries: Mutex<Vec<DeadLetterEntry>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Snapshot of everything written so far.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn write(&self, entry: &DeadLetterEntry) -> Result<String, DlqError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DlqError::ConnectionError("dead-letter store offline".into()));
        }
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push(entry.clone());
        Ok(format!("{}-0", entries.len()))
    }

    async fn len(&self) -> Result<u64, DlqError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dlq_stream_name() {
        assert_eq!(DLQ_STREAM_NAME, "logs:failed");
    }

    #[test]
    fn test_entry_serialization() {
        let message = BufferedMessage::new("1234567890-0", "{broken");
        let entry = DeadLetterEntry::new(&message, FailureReason::ParseError, "expected value");

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value["originalMessage"],
            json!({"id": "1234567890-0", "data": "{broken"})
        );
        assert_eq!(value["failureReason"], "parse_error");
        assert_eq!(value["error"], "expected value");
        assert_eq!(value["retryCount"], 0);
        assert!(value["timestamp"].is_string());

        let back: DeadLetterEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_failure_reason_names() {
        assert_eq!(FailureReason::SinkWriteError.to_string(), "sink_write_error");
        assert_eq!(
            serde_json::to_value(FailureReason::MaxDeliveriesExceeded).unwrap(),
            "max_deliveries_exceeded"
        );
    }

    #[tokio::test]
    async fn test_memory_dead_letters() {
        let dlq = MemoryDeadLetters::new();
        let message = BufferedMessage::new("1-0", "{}");

        dlq.write(&DeadLetterEntry::new(&message, FailureReason::SinkWriteError, "mapping"))
            .await
            .unwrap();
        assert_eq!(dlq.len().await.unwrap(), 1);

        dlq.set_failing(true);
        assert!(dlq
            .write(&DeadLetterEntry::new(&message, FailureReason::SinkWriteError, "x"))
            .await
            .is_err());
        assert_eq!(dlq.entries().len(), 1);
    }
}
