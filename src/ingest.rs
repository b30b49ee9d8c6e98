//! Ingestion hand-off: buffer first, local file when the buffer is down.
//!
//! The HTTP layer in front of this (authentication, rate limiting, request
//! validation) lives elsewhere; it hands over an already validated event.

use crate::buffer::IntakeBuffer;
use crate::event::LogEvent;
use crate::fallback::{FallbackLogger, FallbackWrite};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Where a submitted event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Durably appended to the intake buffer
    Buffered { log_id: String, message_id: String },
    /// Buffer unavailable; written to the local fallback log
    Fallback { log_id: String, path: PathBuf },
}

impl Submission {
    pub fn log_id(&self) -> &str {
        match self {
            Submission::Buffered { log_id, .. } | Submission::Fallback { log_id, .. } => log_id,
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Neither the buffer nor the fallback log accepted the event
    #[error("event {log_id} lost: buffer rejected it ({reason}) and the fallback write failed")]
    Lost { log_id: String, reason: String },
}

#[derive(Clone)]
pub struct Ingestor {
    buffer: Arc<dyn IntakeBuffer>,
    fallback: Arc<FallbackLogger>,
}

impl Ingestor {
    pub fn new(buffer: Arc<dyn IntakeBuffer>, fallback: Arc<FallbackLogger>) -> Self {
        Self { buffer, fallback }
    }

    /// Submit one event. Missing `log_id`/`timestamp` are filled in first so
    /// both the buffered and the fallback copy carry the same id.
    pub async fn submit(&self, event: LogEvent) -> Result<Submission, IngestError> {
        let event = event.with_defaults();
        let log_id = event.id.clone().unwrap_or_default();

        let reason = match self.buffer.append(&event).await {
            Ok(message_id) => {
                debug!(log_id = %log_id, message_id = %message_id, "Event buffered");
                return Ok(Submission::Buffered { log_id, message_id });
            }
            Err(e) => e.to_string(),
        };

        warn!(
            log_id = %log_id,
            buffer = %self.buffer.name(),
            error = %reason,
            "Intake buffer unavailable, writing event to fallback log"
        );

        match self.fallback.write(&event).await {
            FallbackWrite::Persisted(path) => Ok(Submission::Fallback { log_id, path }),
            FallbackWrite::Lost => Err(IngestError::Lost { log_id, reason }),
        }
    }
}
