//! # logflow
//!
//! Durable log delivery: events are appended to a Redis stream, drained by
//! batch workers, routed to a storage profile and written to Elasticsearch,
//! MongoDB, or both.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> Ingestor -> Redis Stream -> BatchWorker -> RoutingRules -> Sinks
//!                 |                            |
//!                 v                            v
//!          fallback files               dead-letter stream
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Log event schema and buffered messages
//! - [`profile`]: Storage profiles and the profile registry
//! - [`routing`]: Four-tier profile resolution
//! - [`buffer`]: Intake buffer contract, Redis Streams and in-memory backends
//! - [`dlq`]: Dead-letter entries and queues
//! - [`fallback`]: Local NDJSON files used when the buffer is down
//! - [`ingest`]: Producer-side hand-off
//! - [`sinks`]: Search index and document store writers
//! - [`worker`]: The batch worker loop
//! - [`config`]: TOML config with environment overrides
//! - [`shutdown`]: Graceful shutdown signal

pub mod buffer;
pub mod config;
pub mod dlq;
pub mod event;
pub mod fallback;
pub mod ingest;
pub mod profile;
pub mod routing;
pub mod shutdown;
pub mod sinks;
pub mod worker;

pub use buffer::{IntakeBuffer, MemoryBuffer, RedisStreamBuffer};
pub use config::{ConfigError, LogflowConfig};
pub use dlq::{DeadLetterEntry, DeadLetterSink, FailureReason, RedisDeadLetterQueue, DLQ_STREAM_NAME};
pub use event::{BufferedMessage, Kind, Level, LogEvent};
pub use fallback::FallbackLogger;
pub use ingest::{Ingestor, Submission};
pub use profile::{Destination, ProfileRegistry, StorageProfile};
pub use routing::RoutingRules;
pub use shutdown::ShutdownSignal;
pub use sinks::{ElasticsearchSink, MongoDocumentSink, Sink};
pub use worker::{BatchWorker, Sinks, WorkerSettings};

/// Redis stream holding buffered events
pub const LOG_STREAM_NAME: &str = "logs:stream";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "log-workers";
