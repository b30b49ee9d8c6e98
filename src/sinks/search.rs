//! Elasticsearch sink - bulk indexing over HTTP.
//!
//! Each call becomes one `POST /_bulk` request whose body is NDJSON:
//!
//! ```text
//! {"index":{"_index":"logs-hot-2025.12.02","_id":"<log_id>"}}
//! {"log_id":"<log_id>","level":"ERROR",...}
//! ```
//!
//! The event id is used as the document `_id`, so a redelivered event
//! overwrites its earlier copy instead of duplicating it.
//!
//! # Example
//!
//! ```rust,ignore
//! use logflow::sinks::ElasticsearchSink;
//! use std::time::Duration;
//!
//! let sink = ElasticsearchSink::new("http://localhost:9200")?
//!     .with_timeout(Duration::from_secs(30))?
//!     .with_api_key("base64-key");
//! ```

use super::{ItemFailure, PartialResult, Sink, SinkError, SinkRecord};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default timeout for bulk requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum Auth {
    None,
    Basic { username: String, password: String },
    ApiKey(String),
}

/// Search index sink backed by the Elasticsearch bulk API.
#[derive(Debug, Clone)]
pub struct ElasticsearchSink {
    /// Base URL of the cluster, without trailing slash
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    auth: Auth,

    timeout: Duration,
    verify_tls: bool,
}

impl ElasticsearchSink {
    pub fn new(url: impl Into<String>) -> Result<Self, SinkError> {
        let url = url.into().trim_end_matches('/').to_string();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SinkError::Config(format!(
                "Elasticsearch URL must start with http:// or https:// (got '{}')",
                url
            )));
        }

        Ok(Self {
            url,
            client: build_client(DEFAULT_TIMEOUT, true)?,
            auth: Auth::None,
            timeout: DEFAULT_TIMEOUT,
            verify_tls: true,
        })
    }

    /// Set custom request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, SinkError> {
        self.client = build_client(timeout, self.verify_tls)?;
        self.timeout = timeout;
        Ok(self)
    }

    /// Accept self-signed or otherwise unverifiable certificates when `false`.
    pub fn with_tls_verify(mut self, verify: bool) -> Result<Self, SinkError> {
        self.client = build_client(self.timeout, verify)?;
        self.verify_tls = verify;
        Ok(self)
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Auth::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.auth = Auth::ApiKey(api_key.into());
        self
    }

    fn bulk_url(&self) -> String {
        format!("{}/_bulk", self.url)
    }
}

fn build_client(timeout: Duration, verify_tls: bool) -> Result<Client, SinkError> {
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .build()
        .map_err(|e| SinkError::Config(e.to_string()))
}

/// Build the NDJSON body of a bulk request targeting a single index.
pub fn bulk_body(index: &str, records: &[SinkRecord<'_>]) -> Result<String, SinkError> {
    let mut body = String::new();
    for record in records {
        let action = json!({ "index": { "_index": index, "_id": record.key } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(record.event)?);
        body.push('\n');
    }
    Ok(body)
}

/// Extract item-level failures from a bulk response.
///
/// Items come back in request order; each is an object with a single key
/// (`index`, `create`, ...) holding `status` and, on failure, `error`.
pub fn item_failures(response: &Value) -> Result<Vec<ItemFailure>, SinkError> {
    if !response["errors"].as_bool().unwrap_or(false) {
        return Ok(Vec::new());
    }

    let items = response["items"]
        .as_array()
        .ok_or_else(|| SinkError::Protocol("bulk response reports errors but has no items".into()))?;

    Ok(items
        .iter()
        .enumerate()
        .filter_map(|(position, item)| {
            let result = item.as_object()?.values().next()?;
            let error = result.get("error")?;
            Some(ItemFailure {
                position,
                error: describe_error(error),
            })
        })
        .collect())
}

fn describe_error(error: &Value) -> String {
    match (error["type"].as_str(), error["reason"].as_str()) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn write_batch(
        &self,
        target: &str,
        records: &[SinkRecord<'_>],
    ) -> Result<PartialResult, SinkError> {
        if records.is_empty() {
            return Ok(PartialResult::default());
        }

        let body = bulk_body(target, records)?;

        debug!(
            index = %target,
            documents = records.len(),
            bytes = body.len(),
            "Sending bulk request"
        );

        let request = self
            .client
            .post(self.bulk_url())
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);

        let request = match &self.auth {
            Auth::None => request,
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::ApiKey(key) => request.header("Authorization", format!("ApiKey {}", key)),
        };

        let response = request.send().await.map_err(|e| {
            error!(index = %target, error = %e, "Bulk request failed");
            SinkError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(index = %target, status = %status, "Bulk request rejected");
            return Err(SinkError::Unavailable(format!("HTTP {}: {}", status, text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| SinkError::Protocol(e.to_string()))?;

        let failures = item_failures(&payload)?;
        if !failures.is_empty() {
            warn!(
                index = %target,
                failed = failures.len(),
                documents = records.len(),
                "Some items failed to index"
            );
        }

        Ok(PartialResult {
            attempted: records.len(),
            failures,
        })
    }
}
