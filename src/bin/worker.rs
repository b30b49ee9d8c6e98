//! logflow worker - drains the log stream into Elasticsearch and MongoDB
//!
//! The worker reads batches from the Redis stream as a member of a consumer
//! group, routes every event to a storage profile and writes it to the
//! profile's destinations. Messages are acknowledged only once they are
//! stored or dead-lettered.
//!
//! ## Configuration
//!
//! `config/logflow.toml` (or `LOGFLOW_CONFIG`), then environment variables:
//! - `REDIS_URL`: Redis connection string
//! - `LOG_WORKER_NAME`: Unique consumer name (default: worker-<hostname> or UUID)
//! - `LOG_CONSUMER_GROUP`: Consumer group name (default: "log-workers")
//! - `ELASTICSEARCH_URL`, `MONGODB_URI`: sink endpoints
//! - `LOG_SHUTDOWN_TIMEOUT_MS`: how long draining may take (default: 30000)
//! - `RUST_LOG`: Logging level (default: "info")

use deadpool_redis::{Config, Runtime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use logflow::buffer::{IntakeBuffer, QueueDepths, RedisStreamBuffer};
use logflow::config::LogflowConfig;
use logflow::dlq::RedisDeadLetterQueue;
use logflow::sinks::MongoDocumentSink;
use logflow::worker::{BatchWorker, Sinks};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = LogflowConfig::load()?;

    // Dangling profile references are fatal
    let profiles = config.build_profiles()?;
    let rules = match config.build_routing(&profiles) {
        Ok(rules) => rules,
        Err(e) => {
            error!(error = %e, "Invalid routing configuration, refusing to start");
            return Err(e.into());
        }
    };

    let settings = config.worker_settings();
    info!(
        worker_name = %settings.consumer_name,
        consumer_group = %settings.consumer_group,
        stream = %config.redis.stream,
        profiles = profiles.len(),
        "logflow worker starting"
    );

    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;

    let buffer = Arc::new(
        RedisStreamBuffer::new(pool.clone(), config.redis.stream.clone())
            .with_claim_idle(Duration::from_millis(config.redis.claim_idle_ms)),
    );
    buffer.ensure_group(&settings.consumer_group).await?;
    info!(consumer_group = %settings.consumer_group, "Consumer group ready");

    let dead_letters = Arc::new(RedisDeadLetterQueue::new(pool, config.redis.dlq_stream.clone()));

    let depths = QueueDepths::collect(buffer.as_ref(), dead_letters.as_ref()).await;
    info!(
        buffer = ?depths.buffer,
        dead_letters = ?depths.dead_letters,
        "Queue depths at startup"
    );

    let search = config.build_search_sink()?;
    let documents =
        MongoDocumentSink::connect(&config.mongodb.uri, config.mongodb.database.as_deref())
            .await?;
    let sinks = Sinks {
        search: Arc::new(search),
        documents: Arc::new(documents),
    };

    let mut worker = BatchWorker::new(buffer, dead_letters, sinks, profiles, rules, settings)?;

    let shutdown = config.shutdown_signal();
    let listener = shutdown.clone();
    tokio::spawn(async move { listener.wait().await });

    let Some(stats) = shutdown.bounded(worker.run(&shutdown)).await else {
        error!(
            timeout_ms = shutdown.timeout().as_millis() as u64,
            "Drain did not finish in time, unacknowledged messages stay pending"
        );
        return Ok(());
    };

    if stats.failed_batches > 0 {
        warn!(
            failed_batches = stats.failed_batches,
            "Some batches were abandoned and left pending for redelivery"
        );
    }
    info!(
        batches = stats.batches,
        written = stats.written,
        dead_lettered = stats.dead_lettered,
        "Worker exited"
    );

    Ok(())
}
