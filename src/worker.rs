//! Batch worker: drains the intake buffer into the storage sinks.
//!
//! One cycle reads a batch, resolves every event to a storage profile,
//! groups the events per sink and target, writes each group with a single
//! bulk call, then acknowledges or dead-letters every message.
//!
//! ```text
//! Idle ─► Reading ─► Resolving ─► Writing ─► Acknowledging ─► Idle
//!                                                    │
//!                   shutdown (between cycles) ─► Draining ─► Stopped
//! ```
//!
//! Failure handling per message:
//!
//! - unparseable payload: dead-lettered (`parse_error`) and acknowledged at once
//! - delivered more than `max_deliveries` times: dead-lettered and acknowledged
//! - rejected by a sink: dead-lettered (`sink_write_error` or
//!   `document_store_error`) and acknowledged
//! - sink unreachable: the whole cycle is abandoned, nothing is acknowledged,
//!   and the buffer redelivers the batch after the backoff
//!
//! A message whose dead-letter write fails is left pending as well, and the
//! loop backs off before reading it again.

use crate::buffer::{BufferError, IntakeBuffer};
use crate::dlq::{DeadLetterEntry, DeadLetterSink, FailureReason};
use crate::event::{BufferedMessage, LogEvent};
use crate::profile::{Destination, ProfileRegistry};
use crate::routing::{RoutingError, RoutingRules};
use crate::shutdown::ShutdownSignal;
use crate::sinks::{Sink, SinkError, SinkRecord};
use crate::DEFAULT_CONSUMER_GROUP;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Phase of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reading,
    Resolving,
    Writing,
    Acknowledging,
    Draining,
    Stopped,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("intake buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("{sink} sink failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Tunables of the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block_timeout: Duration,
    /// Pause after a failed cycle
    pub backoff: Duration,
    pub max_deliveries: u64,
    /// Search index for profiles without an index prefix
    pub index_alias: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: "worker".to_string(),
            batch_size: 200,
            block_timeout: Duration::from_millis(2000),
            backoff: Duration::from_millis(1000),
            max_deliveries: 5,
            index_alias: "logs".to_string(),
        }
    }
}

/// The two storage backends a profile can point at.
#[derive(Clone)]
pub struct Sinks {
    pub search: Arc<dyn Sink>,
    pub documents: Arc<dyn Sink>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub read: usize,
    /// Delivered to every destination of its profile
    pub written: usize,
    pub dead_lettered: usize,
    pub acknowledged: usize,
    /// Neither written nor dead-lettered; will be redelivered
    pub left_pending: usize,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.read == 0
    }
}

/// Totals since the worker started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: u64,
    pub failed_batches: u64,
    pub read: u64,
    pub written: u64,
    pub dead_lettered: u64,
    pub acknowledged: u64,
}

impl WorkerStats {
    fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.read += report.read as u64;
        self.written += report.written as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.acknowledged += report.acknowledged as u64;
    }
}

/// A parsed message waiting to be written.
struct Routed<'a> {
    message: &'a BufferedMessage,
    key: String,
    event: LogEvent,
}

/// Positions into the routed list, grouped by target (index or collection).
type Groups = BTreeMap<String, Vec<usize>>;

pub struct BatchWorker {
    buffer: Arc<dyn IntakeBuffer>,
    dead_letters: Arc<dyn DeadLetterSink>,
    sinks: Sinks,
    profiles: ProfileRegistry,
    rules: RoutingRules,
    settings: WorkerSettings,
    state: watch::Sender<WorkerState>,
    stats: WorkerStats,
}

impl BatchWorker {
    /// Fails if the routing rules reference a profile missing from `profiles`.
    pub fn new(
        buffer: Arc<dyn IntakeBuffer>,
        dead_letters: Arc<dyn DeadLetterSink>,
        sinks: Sinks,
        profiles: ProfileRegistry,
        rules: RoutingRules,
        settings: WorkerSettings,
    ) -> Result<Self, WorkerError> {
        rules.validate(&profiles)?;
        let (state, _) = watch::channel(WorkerState::Idle);

        Ok(Self {
            buffer,
            dead_letters,
            sinks,
            profiles,
            rules,
            settings,
            state,
            stats: WorkerStats::default(),
        })
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions from another task.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run cycles until shutdown is triggered, then drain.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> WorkerStats {
        info!(
            consumer = %self.settings.consumer_name,
            consumer_group = %self.settings.consumer_group,
            buffer = %self.buffer.name(),
            batch_size = self.settings.batch_size,
            "Worker started"
        );

        while !shutdown.is_triggered() {
            match self.process_batch().await {
                // Own pending entries come back without blocking
                Ok(report) if report.left_pending > 0 => {
                    warn!(
                        left_pending = report.left_pending,
                        backoff_ms = self.settings.backoff.as_millis() as u64,
                        "Dead-letter writes failed, backing off"
                    );
                    self.back_off(shutdown).await;
                }
                Ok(_) => {}
                Err(e) => {
                    self.stats.failed_batches += 1;
                    error!(
                        error = %e,
                        backoff_ms = self.settings.backoff.as_millis() as u64,
                        "Batch failed, nothing acknowledged"
                    );
                    self.set_state(WorkerState::Idle);
                    self.back_off(shutdown).await;
                }
            }
        }

        info!("Shutdown signal received, draining");
        self.drain().await;
        self.stats.clone()
    }

    async fn back_off(&self, shutdown: &ShutdownSignal) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.backoff) => {}
            _ = shutdown.triggered() => {}
        }
    }

    /// Release sink and buffer connections. No further batches are started.
    pub async fn drain(&mut self) {
        self.set_state(WorkerState::Draining);

        for sink in [&self.sinks.search, &self.sinks.documents] {
            if let Err(e) = sink.close().await {
                warn!(sink = %sink.name(), error = %e, "Failed to close sink");
            }
        }
        if let Err(e) = self.buffer.close().await {
            warn!(error = %e, "Failed to close intake buffer");
        }

        self.set_state(WorkerState::Stopped);
        info!(
            batches = self.stats.batches,
            failed_batches = self.stats.failed_batches,
            read = self.stats.read,
            written = self.stats.written,
            dead_lettered = self.stats.dead_lettered,
            "Worker shutdown complete"
        );
    }

    /// Run one read-resolve-write-acknowledge cycle.
    ///
    /// An `Err` means the cycle was abandoned; messages not yet settled stay
    /// pending and are read again by the next cycle.
    pub async fn process_batch(&mut self) -> Result<BatchReport, WorkerError> {
        self.set_state(WorkerState::Reading);
        let messages = self
            .buffer
            .read_batch(
                &self.settings.consumer_group,
                &self.settings.consumer_name,
                self.settings.batch_size,
                self.settings.block_timeout,
            )
            .await?;

        let mut report = BatchReport {
            read: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            self.set_state(WorkerState::Idle);
            return Ok(report);
        }

        debug!(count = messages.len(), "Processing batch");

        self.set_state(WorkerState::Resolving);
        let today = Utc::now().date_naive();
        let mut routed: Vec<Routed<'_>> = Vec::with_capacity(messages.len());
        let mut search_groups = Groups::new();
        let mut document_groups = Groups::new();

        for message in &messages {
            if message.deliveries > self.settings.max_deliveries {
                let detail = format!(
                    "delivered {} times without being settled (max {})",
                    message.deliveries, self.settings.max_deliveries
                );
                warn!(id = %message.id, deliveries = message.deliveries, "Poison message");
                self.settle(message, FailureReason::MaxDeliveriesExceeded, &detail, &mut report)
                    .await?;
                continue;
            }

            let event = match message.parse() {
                Ok(event) => event,
                Err(e) => {
                    warn!(id = %message.id, error = %e, "Unparseable message");
                    self.settle(message, FailureReason::ParseError, &e.to_string(), &mut report)
                        .await?;
                    continue;
                }
            };

            let position = routed.len();
            let profile_name = self.rules.resolve_profile(&event);
            match self.profiles.get(profile_name) {
                Some(profile) => {
                    if profile.writes_to(Destination::SearchIndex) {
                        let index = profile.index_name(&self.settings.index_alias, today);
                        search_groups.entry(index).or_default().push(position);
                    }
                    if profile.writes_to(Destination::DocumentStore) {
                        let collection = profile.collection_name().to_string();
                        document_groups.entry(collection).or_default().push(position);
                    }
                }
                None => {
                    warn!(profile = %profile_name, "Profile not found, using default index");
                    search_groups
                        .entry(self.settings.index_alias.clone())
                        .or_default()
                        .push(position);
                }
            }

            let key = event
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| message.id.clone());
            routed.push(Routed { message, key, event });
        }

        self.set_state(WorkerState::Writing);
        let (search_failures, document_failures) = tokio::join!(
            write_groups(self.sinks.search.as_ref(), &search_groups, &routed),
            write_groups(self.sinks.documents.as_ref(), &document_groups, &routed),
        );
        let search_failures = search_failures?;
        let document_failures = document_failures?;

        // One dead-letter entry per message, even if both sinks rejected it
        let mut failures: HashMap<usize, (FailureReason, String)> = HashMap::new();
        for (position, detail) in document_failures {
            failures.insert(position, (FailureReason::DocumentStoreError, detail));
        }
        for (position, detail) in search_failures {
            failures.insert(position, (FailureReason::SinkWriteError, detail));
        }

        self.set_state(WorkerState::Acknowledging);
        for (position, item) in routed.iter().enumerate() {
            match failures.get(&position) {
                Some((reason, detail)) => {
                    self.settle(item.message, *reason, detail, &mut report).await?;
                }
                None => {
                    self.buffer
                        .ack(&self.settings.consumer_group, &item.message.id)
                        .await?;
                    report.written += 1;
                    report.acknowledged += 1;
                }
            }
        }

        self.stats.record(&report);
        self.set_state(WorkerState::Idle);

        info!(
            read = report.read,
            written = report.written,
            dead_lettered = report.dead_lettered,
            left_pending = report.left_pending,
            "Batch processed"
        );

        if self.stats.batches % 100 == 0 {
            info!(
                batches = self.stats.batches,
                read = self.stats.read,
                written = self.stats.written,
                dead_lettered = self.stats.dead_lettered,
                "Worker statistics"
            );
        }

        Ok(report)
    }

    /// Dead-letter a message and acknowledge it. If the dead-letter write
    /// fails the message stays pending.
    async fn settle(
        &self,
        message: &BufferedMessage,
        reason: FailureReason,
        detail: &str,
        report: &mut BatchReport,
    ) -> Result<(), WorkerError> {
        let entry = DeadLetterEntry::new(message, reason, detail);
        if let Err(e) = self.dead_letters.write(&entry).await {
            error!(
                id = %message.id,
                reason = %reason,
                error = %e,
                "Dead-letter write failed, leaving message pending"
            );
            report.left_pending += 1;
            return Ok(());
        }

        self.buffer
            .ack(&self.settings.consumer_group, &message.id)
            .await?;
        report.dead_lettered += 1;
        report.acknowledged += 1;
        Ok(())
    }
}

/// Write every group with one call; returns `(position, detail)` for each
/// rejected item. The first whole-call failure aborts.
async fn write_groups(
    sink: &dyn Sink,
    groups: &Groups,
    routed: &[Routed<'_>],
) -> Result<Vec<(usize, String)>, WorkerError> {
    let mut failures = Vec::new();

    for (target, positions) in groups {
        let records: Vec<SinkRecord<'_>> = positions
            .iter()
            .map(|&position| SinkRecord {
                key: &routed[position].key,
                event: &routed[position].event,
            })
            .collect();

        let result = sink
            .write_batch(target, &records)
            .await
            .map_err(|source| WorkerError::Sink {
                sink: sink.name().to_string(),
                source,
            })?;

        debug!(
            sink = %sink.name(),
            target = %target,
            written = result.written(),
            failed = result.failures.len(),
            "Group written"
        );

        for failure in result.failures {
            if let Some(&position) = positions.get(failure.position) {
                failures.push((position, failure.error));
            }
        }
    }

    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::dlq::MemoryDeadLetters;
    use crate::event::{Kind, Level};
    use crate::routing::CategoryRule;
    use crate::sinks::{ItemFailure, PartialResult};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const GROUP: &str = "log-workers";

    /// Sink double that records writes and rejects chosen keys.
    #[derive(Default)]
    struct RecordingSink {
        name: &'static str,
        writes: Mutex<Vec<(String, Vec<String>)>>,
        reject: Mutex<HashSet<String>>,
        unavailable: AtomicBool,
        closed: AtomicBool,
        /// Buffer to take offline once the write has been accepted
        cut_buffer: Mutex<Option<Arc<MemoryBuffer>>>,
    }

    impl RecordingSink {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                ..Default::default()
            })
        }

        fn reject(&self, key: &str) {
            self.reject.lock().unwrap().insert(key.to_string());
        }

        fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        fn cut_buffer_on_write(&self, buffer: Arc<MemoryBuffer>) {
            *self.cut_buffer.lock().unwrap() = Some(buffer);
        }

        fn writes(&self) -> Vec<(String, Vec<String>)> {
            self.writes.lock().unwrap().clone()
        }

        fn keys(&self) -> Vec<String> {
            self.writes().into_iter().flat_map(|(_, keys)| keys).collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn write_batch(
            &self,
            target: &str,
            records: &[SinkRecord<'_>],
        ) -> Result<PartialResult, SinkError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(SinkError::Unavailable("connection refused".into()));
            }

            let reject = self.reject.lock().unwrap().clone();
            let failures = records
                .iter()
                .enumerate()
                .filter(|(_, record)| reject.contains(record.key))
                .map(|(position, record)| ItemFailure {
                    position,
                    error: format!("rejected {}", record.key),
                })
                .collect();

            self.writes.lock().unwrap().push((
                target.to_string(),
                records.iter().map(|r| r.key.to_string()).collect(),
            ));

            if let Some(buffer) = self.cut_buffer.lock().unwrap().take() {
                buffer.set_offline(true);
            }

            Ok(PartialResult {
                attempted: records.len(),
                failures,
            })
        }

        async fn close(&self) -> Result<(), SinkError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        buffer: Arc<MemoryBuffer>,
        dlq: Arc<MemoryDeadLetters>,
        search: Arc<RecordingSink>,
        documents: Arc<RecordingSink>,
        worker: BatchWorker,
    }

    async fn harness_with(max_deliveries: u64) -> Harness {
        let buffer = Arc::new(MemoryBuffer::new("logs:stream"));
        buffer.ensure_group(GROUP).await.unwrap();
        let dlq = Arc::new(MemoryDeadLetters::new());
        let search = RecordingSink::new("search");
        let documents = RecordingSink::new("documents");

        let settings = WorkerSettings {
            consumer_group: GROUP.to_string(),
            consumer_name: "worker-test".to_string(),
            batch_size: 50,
            block_timeout: Duration::from_millis(10),
            backoff: Duration::from_millis(10),
            max_deliveries,
            index_alias: "logs".to_string(),
        };

        let worker = BatchWorker::new(
            buffer.clone(),
            dlq.clone(),
            Sinks {
                search: search.clone(),
                documents: documents.clone(),
            },
            ProfileRegistry::builtin(),
            RoutingRules::builtin(),
            settings,
        )
        .unwrap();

        Harness {
            buffer,
            dlq,
            search,
            documents,
            worker,
        }
    }

    async fn harness() -> Harness {
        harness_with(5).await
    }

    fn system_info(id: &str) -> LogEvent {
        LogEvent::new(Kind::System, Level::Info, "svc.request").with_id(id)
    }

    async fn append(buffer: &MemoryBuffer, events: &[LogEvent]) {
        for event in events {
            buffer.append(event).await.unwrap();
        }
    }

    fn today_index(prefix: &str) -> String {
        format!("{}-{}", prefix, Utc::now().format("%Y.%m.%d"))
    }

    #[tokio::test]
    async fn test_empty_read_returns_to_idle() {
        let mut h = harness().await;
        let report = h.worker.process_batch().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(h.worker.state(), WorkerState::Idle);
        assert!(h.search.writes().is_empty());
    }

    #[tokio::test]
    async fn test_events_grouped_into_one_call_per_index() {
        let mut h = harness().await;
        append(
            &h.buffer,
            &[
                system_info("a"),
                system_info("b"),
                LogEvent::new(Kind::System, Level::Debug, "svc.trace").with_id("c"),
            ],
        )
        .await;

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.read, 3);
        assert_eq!(report.written, 3);
        assert_eq!(report.acknowledged, 3);

        let writes = h.search.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&(today_index("logs-hot"), vec!["a".into(), "b".into()])));
        assert!(writes.contains(&(today_index("logs-debug"), vec!["c".into()])));
        assert!(h.documents.writes().is_empty());
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_dead_lettered_and_acked_once() {
        let mut h = harness().await;
        h.buffer.append_raw("{not json").unwrap();
        append(&h.buffer, &[system_info("ok")]).await;

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.written, 1);

        let entries = h.dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_reason, FailureReason::ParseError);
        assert_eq!(entries[0].original_message.id, "1-0");
        assert_eq!(entries[0].original_message.data.as_deref(), Some("{not json"));

        assert_eq!(h.buffer.acknowledged(GROUP), 2);
        assert_eq!(h.buffer.pending(GROUP), 0);

        // Nothing comes back
        assert!(h.worker.process_batch().await.unwrap().is_empty());
        assert_eq!(h.dlq.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_item_failures_dead_lettered_rest_acked() {
        let mut h = harness().await;
        let events: Vec<LogEvent> = (1..=5).map(|i| system_info(&format!("evt-{}", i))).collect();
        append(&h.buffer, &events).await;
        h.search.reject("evt-2");
        h.search.reject("evt-4");

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.read, 5);
        assert_eq!(report.written, 3);
        assert_eq!(report.dead_lettered, 2);
        assert_eq!(report.acknowledged, 5);

        let entries = h.dlq.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.failure_reason == FailureReason::SinkWriteError));
        assert_eq!(entries[0].error, "rejected evt-2");

        assert_eq!(h.buffer.acknowledged(GROUP), 5);
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test]
    async fn test_document_store_failures_are_dead_lettered() {
        let mut h = harness().await;
        let events = [
            LogEvent::new(Kind::Business, Level::Info, "business.order").with_id("o-1"),
            LogEvent::new(Kind::Business, Level::Info, "business.order").with_id("o-2"),
        ];
        append(&h.buffer, &events).await;
        h.documents.reject("o-2");

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(
            h.documents.writes(),
            vec![("logs_long_term".to_string(), vec!["o-1".into(), "o-2".into()])]
        );
        assert_eq!(h.dlq.entries()[0].failure_reason, FailureReason::DocumentStoreError);
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test]
    async fn test_sink_outage_leaves_batch_pending_then_redelivers() {
        let mut h = harness().await;
        let events = [system_info("a"), system_info("b"), system_info("c")];
        append(&h.buffer, &events).await;

        h.search.set_unavailable(true);
        let err = h.worker.process_batch().await.unwrap_err();
        assert!(matches!(err, WorkerError::Sink { .. }));
        assert_eq!(h.buffer.acknowledged(GROUP), 0);
        assert_eq!(h.buffer.pending(GROUP), 3);
        assert!(h.dlq.entries().is_empty());

        h.search.set_unavailable(false);
        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.read, 3);
        assert_eq!(report.written, 3);
        assert_eq!(h.search.keys(), vec!["a", "b", "c"]);
        assert_eq!(h.buffer.acknowledged(GROUP), 3);
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test]
    async fn test_buffer_outage_acknowledges_nothing() {
        let mut h = harness().await;
        append(&h.buffer, &[system_info("a"), system_info("b")]).await;

        h.buffer.set_offline(true);
        assert!(matches!(
            h.worker.process_batch().await,
            Err(WorkerError::Buffer(_))
        ));
        h.buffer.set_offline(false);

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.read, 2);
        assert_eq!(h.buffer.acknowledged(GROUP), 2);
    }

    #[tokio::test]
    async fn test_buffer_lost_during_write_acknowledges_nothing() {
        let mut h = harness().await;
        append(&h.buffer, &[system_info("a"), system_info("b")]).await;
        h.search.cut_buffer_on_write(h.buffer.clone());

        assert!(matches!(
            h.worker.process_batch().await,
            Err(WorkerError::Buffer(_))
        ));
        assert_eq!(h.search.keys(), vec!["a", "b"]);
        assert_eq!(h.buffer.acknowledged(GROUP), 0);
        assert!(h.dlq.entries().is_empty());

        h.buffer.set_offline(false);
        assert_eq!(h.buffer.pending(GROUP), 2);

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.read, 2);
        assert_eq!(report.acknowledged, 2);
        // Same keys again, so the sink overwrites instead of duplicating
        assert_eq!(h.search.keys(), vec!["a", "b", "a", "b"]);
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test]
    async fn test_critical_profile_reaches_both_sinks() {
        let mut h = harness().await;
        append(
            &h.buffer,
            &[LogEvent::new(Kind::System, Level::Error, "payments.charge").with_id("pay-1")],
        )
        .await;

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(
            h.search.writes(),
            vec![(today_index("logs-critical"), vec!["pay-1".to_string()])]
        );
        assert_eq!(
            h.documents.writes(),
            vec![("logs_critical".to_string(), vec!["pay-1".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_dlq_category_overrides_kind_and_level() {
        let mut h = harness().await;
        append(
            &h.buffer,
            &[LogEvent::new(Kind::Security, Level::Fatal, "dlq.retry").with_id("r-1")],
        )
        .await;

        h.worker.process_batch().await.unwrap();
        assert!(h.search.writes().is_empty());
        assert_eq!(
            h.documents.writes(),
            vec![("logs_dlq".to_string(), vec!["r-1".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_message_id_used_when_event_has_no_id() {
        let mut h = harness().await;
        let id = h.buffer.append(&LogEvent::new(Kind::System, Level::Info, "svc")).await.unwrap();

        h.worker.process_batch().await.unwrap();
        assert_eq!(h.search.keys(), vec![id]);
    }

    #[tokio::test]
    async fn test_poison_message_dead_lettered_after_max_deliveries() {
        let mut h = harness_with(2).await;
        append(&h.buffer, &[system_info("poison")]).await;
        h.search.set_unavailable(true);

        assert!(h.worker.process_batch().await.is_err());
        assert!(h.worker.process_batch().await.is_err());

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(
            h.dlq.entries()[0].failure_reason,
            FailureReason::MaxDeliveriesExceeded
        );
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_write_leaves_message_pending() {
        let mut h = harness().await;
        h.buffer.append_raw("not json").unwrap();
        h.dlq.set_failing(true);

        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.left_pending, 1);
        assert_eq!(report.acknowledged, 0);
        assert_eq!(h.buffer.pending(GROUP), 1);

        h.dlq.set_failing(false);
        let report = h.worker.process_batch().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.buffer.pending(GROUP), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_backs_off_while_dead_letters_fail() {
        let mut h = harness().await;
        h.buffer.append_raw("{not json").unwrap();
        h.dlq.set_failing(true);

        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.trigger();
        });

        let stats = tokio::time::timeout(Duration::from_secs(5), h.worker.run(&shutdown))
            .await
            .unwrap();

        // 10ms backoff bounds the cycles to about 20 in 200ms
        assert!(stats.batches >= 1);
        assert!(stats.batches < 40, "spun {} cycles", stats.batches);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(h.buffer.pending(GROUP), 1);
        assert!(h.dlq.entries().is_empty());
    }

    #[tokio::test]
    async fn test_rules_validated_on_construction() {
        let rules = RoutingRules::new("NOPE")
            .with_category(CategoryRule::new("x.*", "HOT_SEARCH").unwrap());
        let buffer = Arc::new(MemoryBuffer::new("logs:stream"));
        let sinks = Sinks {
            search: RecordingSink::new("search"),
            documents: RecordingSink::new("documents"),
        };

        let result = BatchWorker::new(
            buffer,
            Arc::new(MemoryDeadLetters::new()),
            sinks,
            ProfileRegistry::builtin(),
            rules,
            WorkerSettings::default(),
        );
        assert!(matches!(
            result,
            Err(WorkerError::Routing(RoutingError::UnknownProfiles(ref names))) if names == &["NOPE"]
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_drains() {
        let mut h = harness().await;
        append(&h.buffer, &[system_info("a"), system_info("b")]).await;

        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        let mut states = h.worker.subscribe_state();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        let stats = tokio::time::timeout(Duration::from_secs(5), h.worker.run(&shutdown))
            .await
            .unwrap();

        assert_eq!(stats.written, 2);
        assert_eq!(stats.failed_batches, 0);
        assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);
        assert!(h.search.closed.load(Ordering::SeqCst));
        assert!(h.documents.closed.load(Ordering::SeqCst));
        assert_eq!(h.buffer.pending(GROUP), 0);
    }
}
