//! Local file fallback for events the intake buffer could not accept.
//!
//! Events are appended as JSON lines under a directory per UTC day:
//!
//! ```text
//! <dir>/2025-12-02/logs-2025-12-02T10-15-00-0.jsonl
//! <dir>/2025-12-02/logs-2025-12-02T11-40-12-1.jsonl
//! ```
//!
//! A new file is started when the current one reaches `max_file_size` or the
//! day changes. Day directories older than the retention window are removed
//! by a background task, at most once an hour.

use crate::event::LogEvent;
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Default fallback directory
pub const DEFAULT_FALLBACK_DIR: &str = "./logs/fallback";

/// Rotate once the current file reaches this size (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub const DEFAULT_RETENTION_DAYS: u32 = 7;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Outcome of a fallback write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackWrite {
    /// The event was appended to this file
    Persisted(PathBuf),
    /// Nothing could be written; the event was only logged
    Lost,
}

#[derive(Debug)]
struct CurrentFile {
    path: PathBuf,
    date: NaiveDate,
    size: u64,
}

#[derive(Debug, Default)]
struct FileState {
    current: Option<CurrentFile>,
    rotations: u64,
}

/// Rotating JSON-lines writer of last resort.
#[derive(Debug)]
pub struct FallbackLogger {
    dir: PathBuf,
    max_file_size: u64,
    retention_days: u32,
    state: Mutex<FileState>,
    last_cleanup: StdMutex<Option<Instant>>,
}

impl FallbackLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            retention_days: DEFAULT_RETENTION_DAYS,
            state: Mutex::new(FileState::default()),
            last_cleanup: StdMutex::new(None),
        }
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Append one event. Never fails; a failed write is reported as
    /// [`FallbackWrite::Lost`] and logged at ERROR together with the event.
    pub async fn write(&self, event: &LogEvent) -> FallbackWrite {
        let line = match serde_json::to_string(event) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                error!(error = %e, event = ?event, "Fallback write failed, event lost");
                return FallbackWrite::Lost;
            }
        };

        let outcome = match self.append_line(&line).await {
            Ok(path) => FallbackWrite::Persisted(path),
            Err(e) => {
                error!(
                    error = %e,
                    dir = %self.dir.display(),
                    event = %line.trim_end(),
                    "Fallback write failed, event lost"
                );
                FallbackWrite::Lost
            }
        };

        self.schedule_cleanup();
        outcome
    }

    async fn append_line(&self, line: &str) -> std::io::Result<PathBuf> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let today = now.date_naive();

        let needs_rotation = match &state.current {
            None => true,
            Some(current) => current.date != today || current.size >= self.max_file_size,
        };

        if needs_rotation {
            let date_dir = self.dir.join(today.format("%Y-%m-%d").to_string());
            fs::create_dir_all(&date_dir).await?;

            let name = format!(
                "logs-{}-{}.jsonl",
                now.format("%Y-%m-%dT%H-%M-%S"),
                state.rotations
            );
            let path = date_dir.join(name);
            info!(file = %path.display(), "Rotated fallback log file");

            state.rotations += 1;
            state.current = Some(CurrentFile {
                path,
                date: today,
                size: 0,
            });
        }

        let Some(current) = state.current.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "no current file"));
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        current.size += line.len() as u64;
        debug!(file = %current.path.display(), size = current.size, "Event written to fallback log");
        Ok(current.path.clone())
    }

    fn schedule_cleanup(&self) {
        {
            let mut last = self
                .last_cleanup
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.is_some_and(|at| at.elapsed() < CLEANUP_INTERVAL) {
                return;
            }
            *last = Some(Instant::now());
        }

        let dir = self.dir.clone();
        let retention_days = self.retention_days;
        tokio::spawn(async move {
            remove_expired(&dir, retention_days, Utc::now().date_naive()).await;
        });
    }

    /// Remove day directories older than the retention window now.
    /// Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        remove_expired(&self.dir, self.retention_days, Utc::now().date_naive()).await
    }
}

/// Delete `<dir>/<YYYY-MM-DD>` directories dated before `today - retention_days`.
/// Errors are logged and skipped.
async fn remove_expired(dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let cutoff = today - chrono::Duration::days(i64::from(retention_days));

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Skipping fallback cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name();
        let Some(date) = name
            .to_str()
            .and_then(|name| NaiveDate::parse_from_str(name, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if is_dir && date < cutoff {
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!(dir = %entry.path().display(), "Removed expired fallback logs");
                    removed += 1;
                }
                Err(e) => warn!(dir = %entry.path().display(), error = %e, "Failed to remove expired fallback logs"),
            }
        }
    }
    removed
}
