//! Durable intake buffer with consumer-group semantics.
//!
//! The buffer is an append-only ordered log. Producers append events, the
//! worker reads them through a named consumer group and acknowledges each
//! message once it has been settled. Unacknowledged messages are handed out
//! again, first to the consumer that holds them and, after an idle period,
//! to any other member of the group. Delivery is at-least-once.
//!
//! ## Implementations
//!
//! - [`RedisStreamBuffer`]: Redis Streams (`XADD`/`XREADGROUP`/`XACK`)
//! - [`MemoryBuffer`]: in-process, same semantics, for tests and embedding

pub mod memory;
pub mod redis;

use crate::dlq::DeadLetterSink;
use crate::event::{BufferedMessage, LogEvent};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub use self::memory::MemoryBuffer;
pub use self::redis::RedisStreamBuffer;

/// Errors returned by an intake buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer connection error: {0}")]
    Connection(String),

    #[error("buffer command error: {0}")]
    Command(String),

    #[error("consumer group '{0}' does not exist")]
    NoSuchGroup(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Contract of the durable intake buffer.
///
/// The consumer-group cursor and pending lists belong to the implementation;
/// callers only read and acknowledge.
#[async_trait]
pub trait IntakeBuffer: Send + Sync {
    /// Name of the underlying log (stream key)
    fn name(&self) -> &str;

    /// Create the consumer group if it does not exist yet. Idempotent.
    async fn ensure_group(&self, group: &str) -> Result<(), BufferError>;

    /// Append an event, returning the buffer-assigned message id.
    async fn append(&self, event: &LogEvent) -> Result<String, BufferError>;

    /// Read up to `max_count` messages for `consumer`.
    ///
    /// Blocks up to `block` when nothing is available and then returns an
    /// empty batch rather than an error.
    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BufferedMessage>, BufferError>;

    /// Acknowledge a message, removing it from the group's pending list.
    async fn ack(&self, group: &str, message_id: &str) -> Result<(), BufferError>;

    /// Number of entries in the log.
    async fn len(&self) -> Result<u64, BufferError>;

    /// Release connections.
    async fn close(&self) -> Result<(), BufferError> {
        Ok(())
    }
}

/// Read-only counters for operator tooling.
///
/// A `None` means the backend could not be queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub buffer: Option<u64>,
    pub dead_letters: Option<u64>,
}

impl QueueDepths {
    pub async fn collect(buffer: &dyn IntakeBuffer, dead_letters: &dyn DeadLetterSink) -> Self {
        let buffer_len = match buffer.len().await {
            Ok(len) => Some(len),
            Err(e) => {
                warn!(error = %e, stream = %buffer.name(), "Failed to read buffer length");
                None
            }
        };
        let dead_letter_len = match dead_letters.len().await {
            Ok(len) => Some(len),
            Err(e) => {
                warn!(error = %e, "Failed to read dead-letter length");
                None
            }
        };

        Self {
            buffer: buffer_len,
            dead_letters: dead_letter_len,
        }
    }
}
