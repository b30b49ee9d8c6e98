//! In-process intake buffer.
//!
//! Mirrors the Redis Streams consumer-group behaviour closely enough for the
//! worker to be exercised without a server: per-group cursor, per-consumer
//! pending lists with delivery counters, idle-entry claiming and blocking
//! reads. The buffer can be switched offline to simulate an outage.

use super::{BufferError, IntakeBuffer};
use crate::event::{BufferedMessage, LogEvent};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default idle time after which another consumer's pending entry is claimed.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    cursor: usize,
    /// Delivered, unacknowledged entries by index
    pending: BTreeMap<usize, PendingEntry>,
    acknowledged: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<String>,
    groups: HashMap<String, GroupState>,
}

/// In-memory [`IntakeBuffer`].
#[derive(Debug)]
pub struct MemoryBuffer {
    name: String,
    state: Mutex<State>,
    appended: Notify,
    offline: AtomicBool,
    claim_idle: Duration,
}

impl MemoryBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            offline: AtomicBool::new(false),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    /// Set the idle time after which pending entries move between consumers.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Simulate the backend becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Append a raw payload, bypassing event serialization.
    pub fn append_raw(&self, payload: impl Into<String>) -> Result<String, BufferError> {
        self.check_online()?;
        let id = {
            let mut state = self.lock();
            state.entries.push(payload.into());
            message_id(state.entries.len() - 1)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    /// Number of delivered but unacknowledged messages in a group.
    pub fn pending(&self, group: &str) -> usize {
        self.lock().groups.get(group).map_or(0, |g| g.pending.len())
    }

    /// Number of acknowledgements a group has received.
    pub fn acknowledged(&self, group: &str) -> u64 {
        self.lock().groups.get(group).map_or(0, |g| g.acknowledged)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<(), BufferError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BufferError::Connection(format!("{} is offline", self.name)))
        } else {
            Ok(())
        }
    }

    /// One non-blocking pass: own pending, then idle foreign pending, then new.
    fn try_read(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BufferedMessage>, BufferError> {
        self.check_online()?;

        let mut guard = self.lock();
        let State { entries, groups } = &mut *guard;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| BufferError::NoSuchGroup(group.to_string()))?;
        let now = Instant::now();

        let mut taken: Vec<usize> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .map(|(index, _)| *index)
            .take(max_count)
            .collect();

        if taken.is_empty() {
            taken = group_state
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.delivered_at) >= self.claim_idle)
                .map(|(index, _)| *index)
                .take(max_count)
                .collect();
        }

        let mut batch = Vec::with_capacity(taken.len());
        for index in taken {
            if let Some(entry) = group_state.pending.get_mut(&index) {
                entry.consumer = consumer.to_string();
                entry.delivered_at = now;
                entry.deliveries += 1;
                batch.push(BufferedMessage {
                    id: message_id(index),
                    payload: Some(entries[index].clone()),
                    deliveries: entry.deliveries,
                });
            }
        }
        if !batch.is_empty() {
            return Ok(batch);
        }

        while group_state.cursor < entries.len() && batch.len() < max_count {
            let index = group_state.cursor;
            group_state.cursor += 1;
            group_state.pending.insert(
                index,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            batch.push(BufferedMessage {
                id: message_id(index),
                payload: Some(entries[index].clone()),
                deliveries: 1,
            });
        }

        Ok(batch)
    }
}

#[async_trait]
impl IntakeBuffer for MemoryBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_group(&self, group: &str) -> Result<(), BufferError> {
        self.check_online()?;
        self.lock().groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, event: &LogEvent) -> Result<String, BufferError> {
        let payload = serde_json::to_string(event)?;
        self.append_raw(payload)
    }

    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BufferedMessage>, BufferError> {
        let deadline = Instant::now() + block;

        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.try_read(group, consumer, max_count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, message_id: &str) -> Result<(), BufferError> {
        self.check_online()?;
        let mut state = self.lock();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BufferError::NoSuchGroup(group.to_string()))?;

        if let Some(index) = parse_message_id(message_id) {
            if group_state.pending.remove(&index).is_some() {
                group_state.acknowledged += 1;
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<u64, BufferError> {
        self.check_online()?;
        Ok(self.lock().entries.len() as u64)
    }
}

fn message_id(index: usize) -> String {
    format!("{}-0", index + 1)
}

fn parse_message_id(id: &str) -> Option<usize> {
    let (seq, _) = id.split_once('-')?;
    seq.parse::<usize>().ok()?.checked_sub(1)
}
