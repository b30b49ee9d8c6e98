//! Storage sinks for delivered events.
//!
//! A sink writes a batch of events to one target (a search index or a
//! collection) and reports which items, if any, were rejected. A returned
//! `Err` means the whole call failed and nothing can be assumed written.
//!
//! ## Built-in Sinks
//!
//! - [`ElasticsearchSink`]: one `_bulk` request per target index
//! - [`MongoDocumentSink`]: one upsert per event into the target collection
//!
//! ## Creating Custom Sinks
//!
//! ```rust,ignore
//! use logflow::sinks::{PartialResult, Sink, SinkError, SinkRecord};
//! use async_trait::async_trait;
//!
//! struct StdoutSink;
//!
//! #[async_trait]
//! impl Sink for StdoutSink {
//!     fn name(&self) -> &str {
//!         "stdout"
//!     }
//!
//!     async fn write_batch(
//!         &self,
//!         target: &str,
//!         records: &[SinkRecord<'_>],
//!     ) -> Result<PartialResult, SinkError> {
//!         for record in records {
//!             println!("{target} {}", record.key);
//!         }
//!         Ok(PartialResult::all_written(records.len()))
//!     }
//! }
//! ```

pub mod document;
pub mod search;

use crate::event::LogEvent;
use async_trait::async_trait;
use thiserror::Error;

pub use document::{MongoDocumentSink, StoredLog};
pub use search::ElasticsearchSink;

/// Errors that abort a whole sink call.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Backend could not be reached or refused the request as a whole
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with something we could not interpret
    #[error("unexpected sink response: {0}")]
    Protocol(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sink could not be constructed from its configuration
    #[error("invalid sink configuration: {0}")]
    Config(String),
}

/// An event on its way to a sink, with the key used for idempotent writes.
#[derive(Debug, Clone, Copy)]
pub struct SinkRecord<'a> {
    pub key: &'a str,
    pub event: &'a LogEvent,
}

/// One rejected item of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Position of the item in the batch passed to `write_batch`
    pub position: usize,

    /// The backend's native error detail
    pub error: String,
}

/// Outcome of a batch call that reached the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialResult {
    pub attempted: usize,
    pub failures: Vec<ItemFailure>,
}

impl PartialResult {
    pub fn all_written(attempted: usize) -> Self {
        Self {
            attempted,
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn written(&self) -> usize {
        self.attempted.saturating_sub(self.failures.len())
    }
}

/// A storage backend the worker delivers to.
///
/// Sinks must be `Send + Sync`; the worker shares them across tasks.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Returns the name of this sink (e.g., "elasticsearch", "mongodb")
    fn name(&self) -> &str;

    /// Write `records` to `target` (index or collection name).
    async fn write_batch(
        &self,
        target: &str,
        records: &[SinkRecord<'_>],
    ) -> Result<PartialResult, SinkError>;

    /// Release connections held by the sink.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_result() {
        let all = PartialResult::all_written(3);
        assert!(all.is_success());
        assert_eq!(all.written(), 3);

        let partial = PartialResult {
            attempted: 3,
            failures: vec![ItemFailure {
                position: 1,
                error: "mapper_parsing_exception".into(),
            }],
        };
        assert!(!partial.is_success());
        assert_eq!(partial.written(), 2);
    }
}
