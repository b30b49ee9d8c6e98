//! Core log event types for logflow.
//!
//! The [`LogEvent`] struct is the unit of work flowing through the pipeline.
//! Events are handed over by the ingestion layer, appended to the intake
//! stream, and delivered by the worker to one or more storage backends.
//!
//! Once an event has been appended it is never mutated. Sinks build their
//! own derived representations (bulk documents, stored records) from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl FromStr for Level {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    Business,
    System,
    Analytics,
    Audit,
    Security,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Business,
        Kind::System,
        Kind::Analytics,
        Kind::Audit,
        Kind::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Business => "BUSINESS",
            Kind::System => "SYSTEM",
            Kind::Analytics => "ANALYTICS",
            Kind::Audit => "AUDIT",
            Kind::Security => "SECURITY",
        }
    }
}

impl FromStr for Kind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A level or kind name that is not part of the closed enumeration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// A structured log event.
///
/// # Example
///
/// ```json
/// {
///   "schema_version": 1,
///   "log_id": "0b6c1c9e-6a43-4d7a-9f0c-52a1d1f3a0e2",
///   "timestamp": "2025-12-02T10:00:00Z",
///   "level": "ERROR",
///   "kind": "SYSTEM",
///   "service": "payments",
///   "environment": "production",
///   "category": "payments.charge",
///   "event": "charge_failed",
///   "message": "card declined",
///   "context": {"user_id": "u-42"}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Idempotency key, assigned by the producer or on ingestion
    #[serde(rename = "log_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    /// ISO 8601 event time, kept exactly as received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Value>,

    /// Every other field, including the legacy layout
    /// (`operation`, `accountUID`, `metadata`, `requestId`, ...)
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl LogEvent {
    /// Create an event with the attributes used for routing.
    pub fn new(kind: Kind, level: Level, category: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            level: Some(level),
            category: Some(category.into()),
            ..Default::default()
        }
    }

    /// Set the event id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Set the human readable message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Fill in the id and timestamp if the producer left them out.
    pub fn with_defaults(mut self) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
        if self.timestamp.as_deref().map_or(true, str::is_empty) {
            self.timestamp = Some(Utc::now().to_rfc3339());
        }
        self
    }

    /// True for the structured layout (`schema_version == 1`).
    pub fn is_current_layout(&self) -> bool {
        self.schema_version == Some(1)
    }

    /// Parsed event time, if the timestamp is valid RFC 3339.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Look up a field that is not part of the structured layout.
    pub fn legacy_str(&self, key: &str) -> Option<&str> {
        self.rest.get(key).and_then(Value::as_str)
    }

    /// Look up a string inside the `context` object.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|ctx| ctx.get(key))
            .and_then(Value::as_str)
    }
}

/// Deserialize an enum from a string, treating unknown names as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => match s.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                debug!(value = %s, "Ignoring unrecognised enum value");
                None
            }
        },
        _ => None,
    })
}

/// A raw message read from the intake buffer.
///
/// `payload` is `None` when the stream entry has no `data` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    /// Buffer-assigned message id (e.g., "1733133600000-0")
    pub id: String,

    /// The serialized event as it was appended
    pub payload: Option<String>,

    /// How many times this message has been handed to a consumer, this one included
    pub deliveries: u64,
}

impl BufferedMessage {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Some(payload.into()),
            deliveries: 1,
        }
    }

    /// Parse the payload into a [`LogEvent`].
    pub fn parse(&self) -> Result<LogEvent, ParseError> {
        let payload = self.payload.as_deref().ok_or(ParseError::MissingData)?;
        let event = serde_json::from_str(payload)?;
        Ok(event)
    }
}

/// Why a buffered message could not be turned into a [`LogEvent`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message has no data field")]
    MissingData,

    #[error("invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_deserialize_current_layout() {
        let json_str = r#"{
            "schema_version": 1,
            "log_id": "abc-123",
            "timestamp": "2025-12-02T10:00:00Z",
            "level": "ERROR",
            "kind": "SYSTEM",
            "category": "payments.charge",
            "event": "charge_failed",
            "message": "card declined",
            "context": {"user_id": "u-42"}
        }"#;

        let event: LogEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.id.as_deref(), Some("abc-123"));
        assert_eq!(event.level, Some(Level::Error));
        assert_eq!(event.kind, Some(Kind::System));
        assert_eq!(event.category.as_deref(), Some("payments.charge"));
        assert_eq!(event.context_str("user_id"), Some("u-42"));
        assert!(event.is_current_layout());
        assert!(event.rest.is_empty());
    }

    #[test]
    fn test_event_deserialize_legacy_layout() {
        let json_str = r#"{
            "category": "BUSINESS",
            "operation": "purchase",
            "accountUID": "acc-1",
            "metadata": {"amount": 12.5}
        }"#;

        let event: LogEvent = serde_json::from_str(json_str).unwrap();
        assert!(!event.is_current_layout());
        assert_eq!(event.legacy_str("operation"), Some("purchase"));
        assert_eq!(event.legacy_str("accountUID"), Some("acc-1"));
        assert_eq!(event.rest["metadata"]["amount"], 12.5);
    }

    #[test]
    fn test_id_alias() {
        let event: LogEvent = serde_json::from_str(r#"{"id": "e-1"}"#).unwrap();
        assert_eq!(event.id.as_deref(), Some("e-1"));
    }

    #[test]
    fn test_lenient_enums() {
        let event: LogEvent =
            serde_json::from_str(r#"{"level": "warn", "kind": "NOPE"}"#).unwrap();
        assert_eq!(event.level, Some(Level::Warn));
        assert_eq!(event.kind, None);

        let event: LogEvent = serde_json::from_str(r#"{"level": 3}"#).unwrap();
        assert_eq!(event.level, None);
    }

    #[test]
    fn test_serialize_preserves_unknown_fields() {
        let raw = json!({
            "log_id": "x",
            "level": "INFO",
            "operation": "legacy-op",
            "custom": {"nested": true}
        });

        let event: LogEvent = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_with_defaults() {
        let event = LogEvent::default().with_defaults();
        assert!(event.id.is_some());
        assert!(event.event_time().is_some());

        let kept = LogEvent::default()
            .with_id("fixed")
            .with_timestamp("2025-01-01T00:00:00Z")
            .with_defaults();
        assert_eq!(kept.id.as_deref(), Some("fixed"));
        assert_eq!(kept.timestamp.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_level_and_kind_parse() {
        assert_eq!("fatal".parse::<Level>(), Ok(Level::Fatal));
        assert_eq!(" Audit ".parse::<Kind>(), Ok(Kind::Audit));
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_buffered_message_parse() {
        let ok = BufferedMessage::new("1-0", r#"{"category": "a.b"}"#);
        assert_eq!(ok.parse().unwrap().category.as_deref(), Some("a.b"));

        let bad = BufferedMessage::new("2-0", "{not json");
        assert!(matches!(bad.parse(), Err(ParseError::Json(_))));

        let empty = BufferedMessage {
            id: "3-0".into(),
            payload: None,
            deliveries: 1,
        };
        assert!(matches!(empty.parse(), Err(ParseError::MissingData)));
    }
}
