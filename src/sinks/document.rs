//! MongoDB document store sink.
//!
//! Events are stored one document per event, upserted by `log_id`, so a
//! redelivered event replaces its earlier copy. The stored shape keeps the
//! flat fields older consumers query on (`operation`, `userId`, `requestId`,
//! `serviceName`, `env`) alongside the structured ones.

use super::{ItemFailure, PartialResult, Sink, SinkError, SinkRecord};
use crate::event::LogEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions, ReplaceOptions};
use mongodb::{Client, Database, IndexModel};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Database used when neither the config nor the URI names one
pub const DEFAULT_DATABASE: &str = "observability";

/// The document written for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoredLog {
    pub log_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,

    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "accountUID", skip_serializing_if = "Option::is_none")]
    pub account_uid: Option<String>,
    pub metadata: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Value>,

    // Top-level business metrics, legacy layout only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

/// First non-empty string among the candidates.
fn first_str<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// First value that is present and not null, false, 0 or "".
fn first_value<'a>(candidates: impl IntoIterator<Item = Option<&'a Value>>) -> Option<Value> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64() != Some(0.0),
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
        .cloned()
}

fn nested_str<'a>(value: Option<&'a Value>, key: &str) -> Option<&'a str> {
    value.and_then(|v| v.get(key)).and_then(Value::as_str)
}

impl StoredLog {
    /// Map an event to its stored shape; `key` becomes `log_id`.
    pub fn from_event(key: &str, event: &LogEvent) -> Self {
        if event.is_current_layout() {
            Self::from_current(key, event)
        } else {
            Self::from_legacy(key, event)
        }
    }

    fn from_current(key: &str, event: &LogEvent) -> Self {
        let trace = event.trace.as_ref();
        Self {
            log_id: key.to_string(),
            level: event.level.map(|l| l.as_str().to_string()),
            service: event.service.clone(),
            environment: event.environment.clone(),
            kind: event.kind.map(|k| k.as_str().to_string()),
            category: event.category.clone(),
            event: event.event.clone(),
            message: event.message.clone(),
            trace: event.trace.clone(),
            user_id: first_str([event.context_str("user_id"), event.context_str("accountUID")]),
            account_uid: first_str([event.context_str("accountUID"), event.context_str("user_id")]),
            metadata: event.context.clone().unwrap_or_else(|| json!({})),
            payload: Some(event.payload.clone().unwrap_or_else(|| json!({}))),
            host: event.host.clone(),
            tags: Some(event.tags.clone().unwrap_or_else(|| json!([]))),
            extra: Some(event.extra.clone().unwrap_or_else(|| json!({}))),
            tenant_id: event.tenant_id.clone(),
            operation: event.event.clone(),
            request_id: first_str([nested_str(trace, "span_id"), event.context_str("requestId")]),
            service_name: event.service.clone(),
            env: event.environment.clone(),
            ..Default::default()
        }
    }

    fn from_legacy(key: &str, event: &LogEvent) -> Self {
        let metadata = event.rest.get("metadata").filter(|v| !v.is_null());
        let context = event.context.as_ref().filter(|v| !v.is_null());
        let metric = |name: &str| first_value([metadata.and_then(|m| m.get(name)), context.and_then(|c| c.get(name))]);

        Self {
            log_id: key.to_string(),
            category: event.category.clone(),
            operation: first_str([event.legacy_str("operation"), event.event.as_deref()]),
            user_id: first_str([event.legacy_str("accountUID"), event.context_str("accountUID")]),
            account_uid: first_str([event.legacy_str("accountUID"), event.context_str("accountUID")]),
            metadata: metadata.or(context).cloned().unwrap_or_else(|| json!({})),
            amount: metric("amount"),
            currency: metric("currency"),
            status: metric("status"),
            request_id: first_str([
                event.legacy_str("requestId"),
                nested_str(event.trace.as_ref(), "span_id"),
            ]),
            service_name: first_str([event.legacy_str("serviceName"), event.service.as_deref()]),
            env: first_str([event.legacy_str("env"), event.environment.as_deref()]),
            ..Default::default()
        }
    }

    /// Convert to BSON, adding the `timestamp` and `createdAt` dates.
    pub fn to_document(&self, timestamp: DateTime<Utc>) -> Result<Document, SinkError> {
        let mut document = mongodb::bson::to_document(self)
            .map_err(|e| SinkError::Protocol(format!("BSON encoding failed: {}", e)))?;
        document.insert("timestamp", BsonDateTime::from_millis(timestamp.timestamp_millis()));
        document.insert("createdAt", BsonDateTime::now());
        Ok(document)
    }
}

/// Errors meaning the store itself is unreachable, as opposed to one
/// document being rejected.
fn is_connectivity_error(e: &mongodb::error::Error) -> bool {
    matches!(
        *e.kind,
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. }
    )
}

/// Indexes every log collection carries.
///
/// The unique `log_id` index backs the per-event upsert; the other two serve
/// the usual "latest by category" and "latest for a user" lookups.
pub fn index_models() -> Vec<IndexModel> {
    vec![
        IndexModel::builder()
            .keys(doc! { "log_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("log_id_unique".to_string())
                    .unique(true)
                    .build(),
            )
            .build(),
        IndexModel::builder()
            .keys(doc! { "category": 1, "timestamp": -1 })
            .build(),
        IndexModel::builder()
            .keys(doc! { "userId": 1, "timestamp": -1 })
            .build(),
    ]
}

/// Document store sink backed by MongoDB.
#[derive(Clone)]
pub struct MongoDocumentSink {
    client: Client,
    database: Database,
    /// Collections whose indexes are known to exist
    indexed: Arc<Mutex<HashSet<String>>>,
}

impl MongoDocumentSink {
    /// Connect using a MongoDB URI. The database is `database` if given,
    /// else the one named in the URI, else [`DEFAULT_DATABASE`].
    pub async fn connect(uri: &str, database: Option<&str>) -> Result<Self, SinkError> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|e| SinkError::Config(format!("invalid MongoDB URI: {}", e)))?;

        let name = database
            .map(str::to_string)
            .or_else(|| options.default_database.clone())
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let client = Client::with_options(options).map_err(|e| SinkError::Config(e.to_string()))?;
        let database = client.database(&name);

        info!(database = %name, "MongoDB client ready");
        Ok(Self {
            client,
            database,
            indexed: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn is_indexed(&self, collection: &str) -> bool {
        self.indexed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(collection)
    }

    /// Create the collection's indexes once per process. Creating an index
    /// that already exists is a no-op on the server.
    async fn ensure_indexes(&self, collection: &str) -> Result<(), SinkError> {
        if self.is_indexed(collection) {
            return Ok(());
        }

        match self
            .database
            .collection::<Document>(collection)
            .create_indexes(index_models(), None)
            .await
        {
            Ok(_) => {
                debug!(collection = %collection, "Indexes ensured");
                self.indexed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(collection.to_string());
                Ok(())
            }
            Err(e) if is_connectivity_error(&e) => {
                error!(collection = %collection, error = %e, "MongoDB unreachable");
                Err(SinkError::Unavailable(e.to_string()))
            }
            // Retried with the next batch; writes still go through
            Err(e) => {
                warn!(collection = %collection, error = %e, "Failed to create indexes");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Sink for MongoDocumentSink {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn write_batch(
        &self,
        target: &str,
        records: &[SinkRecord<'_>],
    ) -> Result<PartialResult, SinkError> {
        if records.is_empty() {
            return Ok(PartialResult::default());
        }

        self.ensure_indexes(target).await?;

        let collection = self.database.collection::<Document>(target);
        let options = ReplaceOptions::builder().upsert(true).build();
        let mut failures = Vec::new();

        for (position, record) in records.iter().enumerate() {
            let timestamp = record.event.event_time().unwrap_or_else(Utc::now);
            let document = match StoredLog::from_event(record.key, record.event).to_document(timestamp) {
                Ok(document) => document,
                Err(e) => {
                    failures.push(ItemFailure {
                        position,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match collection
                .replace_one(doc! { "log_id": record.key }, document, options.clone())
                .await
            {
                Ok(_) => {}
                Err(e) if is_connectivity_error(&e) => {
                    error!(collection = %target, error = %e, "MongoDB unreachable");
                    return Err(SinkError::Unavailable(e.to_string()));
                }
                Err(e) => {
                    warn!(collection = %target, log_id = %record.key, error = %e, "Document rejected");
                    failures.push(ItemFailure {
                        position,
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            collection = %target,
            documents = records.len(),
            failed = failures.len(),
            "Upserted documents"
        );

        Ok(PartialResult {
            attempted: records.len(),
            failures,
        })
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.client.clone().shutdown().await;
        info!("MongoDB client shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Kind, Level};

    #[test]
    fn test_current_layout_mapping() {
        let event: LogEvent = serde_json::from_value(json!({
            "schema_version": 1,
            "log_id": "evt-1",
            "timestamp": "2025-12-02T10:00:00Z",
            "level": "ERROR",
            "kind": "BUSINESS",
            "service": "checkout",
            "environment": "production",
            "category": "business.order",
            "event": "order_failed",
            "trace": {"trace_id": "t-1", "span_id": "s-1"},
            "context": {"user_id": "u-42"}
        }))
        .unwrap();

        let stored = StoredLog::from_event("evt-1", &event);
        assert_eq!(stored.log_id, "evt-1");
        assert_eq!(stored.level.as_deref(), Some("ERROR"));
        assert_eq!(stored.kind.as_deref(), Some("BUSINESS"));
        assert_eq!(stored.user_id.as_deref(), Some("u-42"));
        assert_eq!(stored.account_uid.as_deref(), Some("u-42"));
        assert_eq!(stored.metadata, json!({"user_id": "u-42"}));
        assert_eq!(stored.operation.as_deref(), Some("order_failed"));
        assert_eq!(stored.request_id.as_deref(), Some("s-1"));
        assert_eq!(stored.service_name.as_deref(), Some("checkout"));
        assert_eq!(stored.env.as_deref(), Some("production"));
        assert_eq!(stored.tags, Some(json!([])));
        assert_eq!(stored.payload, Some(json!({})));
        assert_eq!(stored.amount, None);
    }

    #[test]
    fn test_legacy_layout_mapping() {
        let event: LogEvent = serde_json::from_value(json!({
            "category": "BUSINESS",
            "operation": "purchase",
            "accountUID": "acc-1",
            "metadata": {"amount": 12.5, "currency": "EUR"},
            "context": {"status": "paid"},
            "requestId": "req-9",
            "service": "shop",
            "env": "staging"
        }))
        .unwrap();

        let stored = StoredLog::from_event("1733133600000-0", &event);
        assert_eq!(stored.log_id, "1733133600000-0");
        assert_eq!(stored.operation.as_deref(), Some("purchase"));
        assert_eq!(stored.user_id.as_deref(), Some("acc-1"));
        assert_eq!(stored.metadata, json!({"amount": 12.5, "currency": "EUR"}));
        assert_eq!(stored.amount, Some(json!(12.5)));
        assert_eq!(stored.currency, Some(json!("EUR")));
        assert_eq!(stored.status, Some(json!("paid")));
        assert_eq!(stored.request_id.as_deref(), Some("req-9"));
        assert_eq!(stored.service_name.as_deref(), Some("shop"));
        assert_eq!(stored.env.as_deref(), Some("staging"));
        assert_eq!(stored.level, None);
    }

    #[test]
    fn test_legacy_falls_back_to_event_name() {
        let event = LogEvent {
            event: Some("signup".into()),
            ..LogEvent::new(Kind::Audit, Level::Info, "audit.user")
        };

        let stored = StoredLog::from_event("k", &event);
        assert_eq!(stored.operation.as_deref(), Some("signup"));
        assert_eq!(stored.metadata, json!({}));
    }

    #[test]
    fn test_to_document_sets_dates() {
        let event = LogEvent::new(Kind::System, Level::Info, "system.boot").with_id("k");
        let timestamp = DateTime::parse_from_rfc3339("2025-12-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let document = StoredLog::from_event("k", &event).to_document(timestamp).unwrap();
        assert_eq!(document.get_str("log_id").unwrap(), "k");
        assert_eq!(
            document.get_datetime("timestamp").unwrap().timestamp_millis(),
            timestamp.timestamp_millis()
        );
        assert!(document.get_datetime("createdAt").is_ok());
        assert!(!document.contains_key("amount"));
    }

    #[test]
    fn test_connectivity_errors() {
        let io = mongodb::error::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(is_connectivity_error(&io));

        let not_a_document = mongodb::bson::to_document(&5_i32).unwrap_err();
        let serialization = mongodb::error::Error::from(not_a_document);
        assert!(!is_connectivity_error(&serialization));
    }

    #[test]
    fn test_index_models() {
        let models = index_models();
        assert_eq!(models.len(), 3);

        let log_id = &models[0];
        assert_eq!(log_id.keys, doc! { "log_id": 1 });
        let options = log_id.options.as_ref().unwrap();
        assert_eq!(options.unique, Some(true));

        let keys: Vec<&Document> = models.iter().map(|m| &m.keys).collect();
        assert!(keys.contains(&&doc! { "category": 1, "timestamp": -1 }));
        assert!(keys.contains(&&doc! { "userId": 1, "timestamp": -1 }));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_server() {
        // Client construction does not connect; an empty batch must not either
        let sink = MongoDocumentSink::connect("mongodb://127.0.0.1:9/logs", None)
            .await
            .unwrap();
        let result = sink.write_batch("logs_default", &[]).await.unwrap();
        assert_eq!(result.attempted, 0);
        assert!(!sink.is_indexed("logs_default"));
    }
}
