//! Configuration module for logflow.
//!
//! Loads configuration from a TOML file with `${VAR}` substitution, then
//! applies environment variable overrides. Every section is optional.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "redis://localhost:6379"
//! stream = "logs:stream"
//!
//! [worker]
//! consumer_group = "log-workers"
//! batch_size = 200
//!
//! [elasticsearch]
//! url = "https://search.internal:9200"
//! api_key = "${ELASTICSEARCH_API_KEY}"
//!
//! [profiles.HOT_SEARCH]
//! destinations = ["search_index"]
//! retention_days = 30
//! index_prefix = "logs-hot"
//!
//! [routing]
//! fallback_profile = "HOT_SEARCH"
//! ```

use crate::dlq::DLQ_STREAM_NAME;
use crate::fallback::{
    FallbackLogger, DEFAULT_FALLBACK_DIR, DEFAULT_MAX_FILE_SIZE, DEFAULT_RETENTION_DAYS,
};
use crate::profile::{ProfileError, ProfileRegistry, StorageProfile};
use crate::routing::{RoutingConfig, RoutingError, RoutingRules};
use crate::shutdown::ShutdownSignal;
use crate::sinks::{ElasticsearchSink, SinkError};
use crate::worker::WorkerSettings;
use crate::{DEFAULT_CONSUMER_GROUP, LOG_STREAM_NAME};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogflowConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    #[serde(default)]
    pub mongodb: MongoConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Replaces the built-in profile table when non-empty
    #[serde(default)]
    pub profiles: BTreeMap<String, StorageProfile>,

    /// Replaces the built-in routing rules when present
    #[serde(default)]
    pub routing: Option<RoutingConfig>,
}

/// Redis configuration (intake stream and dead-letter stream)
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_dlq_stream")]
    pub dlq_stream: String,

    /// Idle time before another consumer's pending entry is claimed
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            stream: default_stream(),
            dlq_stream: default_dlq_stream(),
            claim_idle_ms: default_claim_idle_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_stream() -> String {
    LOG_STREAM_NAME.to_string()
}

fn default_dlq_stream() -> String {
    DLQ_STREAM_NAME.to_string()
}

fn default_claim_idle_ms() -> u64 {
    30_000
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Consumer name; defaults to `worker-<hostname>`
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Pause after a failed cycle
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u64,

    /// Index used by search profiles without an index prefix
    #[serde(default = "default_index_alias")]
    pub index_alias: String,

    /// Upper bound on draining after a shutdown signal
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            batch_size: default_batch_size(),
            block_timeout_ms: default_block_timeout_ms(),
            backoff_ms: default_backoff_ms(),
            max_deliveries: default_max_deliveries(),
            index_alias: default_index_alias(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_batch_size() -> usize {
    200
}

fn default_block_timeout_ms() -> u64 {
    2000
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_deliveries() -> u64 {
    5
}

fn default_index_alias() -> String {
    "logs".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

/// Elasticsearch configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    #[serde(default = "default_elasticsearch_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Used only when username/password are not both set
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: default_elasticsearch_url(),
            username: None,
            password: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
            tls_verify: default_tls_verify(),
        }
    }
}

fn default_elasticsearch_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_tls_verify() -> bool {
    true
}

/// MongoDB configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MongoConfig {
    #[serde(default = "default_mongodb_uri")]
    pub uri: String,

    /// Overrides the database named in the URI
    #[serde(default)]
    pub database: Option<String>,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: default_mongodb_uri(),
            database: None,
        }
    }
}

fn default_mongodb_uri() -> String {
    "mongodb://localhost:27017/observability".to_string()
}

/// Fallback file logger configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            dir: default_fallback_dir(),
            retention_days: default_retention_days(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_fallback_dir() -> PathBuf {
    PathBuf::from(DEFAULT_FALLBACK_DIR)
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl LogflowConfig {
    /// Load configuration from the default path or LOGFLOW_CONFIG env var,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("LOGFLOW_CONFIG").unwrap_or_else(|_| "config/logflow.toml".to_string());

        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path, without environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: LogflowConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            profiles = config.profiles.len(),
            custom_routing = config.routing.is_some(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Apply the recognised environment variables on top of the file values.
    ///
    /// `lookup` abstracts `std::env::var` so overrides can be tested without
    /// touching the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(v) = get("REDIS_URL") {
            self.redis.url = v;
        }
        if let Some(v) = get("LOG_STREAM_NAME") {
            self.redis.stream = v;
        }
        if let Some(v) = get("LOG_DLQ_STREAM") {
            self.redis.dlq_stream = v;
        }
        if let Some(v) = get("LOG_CONSUMER_GROUP") {
            self.worker.consumer_group = v;
        }
        if let Some(v) = get("LOG_WORKER_NAME") {
            self.worker.name = Some(v);
        }
        if let Some(v) = get("LOG_BATCH_SIZE") {
            self.worker.batch_size = parse_env("LOG_BATCH_SIZE", v)?;
        }
        if let Some(v) = get("LOG_BLOCK_TIMEOUT_MS") {
            self.worker.block_timeout_ms = parse_env("LOG_BLOCK_TIMEOUT_MS", v)?;
        }
        if let Some(v) = get("LOG_MAX_DELIVERIES") {
            self.worker.max_deliveries = parse_env("LOG_MAX_DELIVERIES", v)?;
        }
        if let Some(v) = get("LOG_INDEX_ALIAS") {
            self.worker.index_alias = v;
        }
        if let Some(v) = get("LOG_SHUTDOWN_TIMEOUT_MS") {
            self.worker.shutdown_timeout_ms = parse_env("LOG_SHUTDOWN_TIMEOUT_MS", v)?;
        }
        if let Some(v) = get("ELASTICSEARCH_URL") {
            self.elasticsearch.url = v;
        }
        if let Some(v) = get("ELASTICSEARCH_USERNAME") {
            self.elasticsearch.username = Some(v);
        }
        if let Some(v) = get("ELASTICSEARCH_PASSWORD") {
            self.elasticsearch.password = Some(v);
        }
        if let Some(v) = get("ELASTICSEARCH_API_KEY") {
            self.elasticsearch.api_key = Some(v);
        }
        if let Some(v) = get("ELASTICSEARCH_TLS_VERIFY") {
            self.elasticsearch.tls_verify = parse_env("ELASTICSEARCH_TLS_VERIFY", v)?;
        }
        if let Some(v) = get("MONGODB_URI") {
            self.mongodb.uri = v;
        }
        if let Some(v) = get("MONGODB_DATABASE") {
            self.mongodb.database = Some(v);
        }
        if let Some(v) = get("FALLBACK_LOG_DIR") {
            self.fallback.dir = PathBuf::from(v);
        }
        if let Some(v) = get("FALLBACK_RETENTION_DAYS") {
            self.fallback.retention_days = parse_env("FALLBACK_RETENTION_DAYS", v)?;
        }

        Ok(())
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.batch_size must be at least 1".to_string(),
            ));
        }

        // BLOCK 0 makes XREADGROUP wait forever
        if self.worker.block_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "worker.block_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.worker.max_deliveries == 0 {
            return Err(ConfigError::ValidationError(
                "worker.max_deliveries must be at least 1".to_string(),
            ));
        }

        let es_url = &self.elasticsearch.url;
        if !es_url.starts_with("http://") && !es_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "elasticsearch.url must start with http:// or https:// (got '{}')",
                es_url
            )));
        }

        for (name, value) in [
            ("elasticsearch.url", Some(es_url)),
            ("elasticsearch.password", self.elasticsearch.password.as_ref()),
            ("elasticsearch.api_key", self.elasticsearch.api_key.as_ref()),
            ("mongodb.uri", Some(&self.mongodb.uri)),
        ] {
            if value.is_some_and(|v| v.contains("${")) {
                warn!(field = %name, "Config value contains unsubstituted environment variable");
            }
        }

        Ok(())
    }

    /// Consumer name for this process: configured name, else
    /// `worker-<hostname>`, else a random id.
    pub fn worker_name(&self) -> String {
        if let Some(name) = self.worker.name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }

        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| format!("worker-{}", h))
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }

    /// The profile table: `[profiles.*]` if any are configured, else the built-ins.
    pub fn build_profiles(&self) -> Result<ProfileRegistry, ConfigError> {
        let registry = if self.profiles.is_empty() {
            ProfileRegistry::builtin()
        } else {
            ProfileRegistry::from_config(&self.profiles)
        };
        registry.validate()?;
        Ok(registry)
    }

    /// The routing rules: `[routing]` if present, else the built-ins.
    /// Fails if any rule names a profile missing from `profiles`.
    pub fn build_routing(&self, profiles: &ProfileRegistry) -> Result<RoutingRules, ConfigError> {
        let rules = match &self.routing {
            Some(routing) => RoutingRules::from_config(routing)?,
            None => RoutingRules::builtin(),
        };
        rules.validate(profiles)?;
        Ok(rules)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            consumer_group: self.worker.consumer_group.clone(),
            consumer_name: self.worker_name(),
            batch_size: self.worker.batch_size,
            block_timeout: Duration::from_millis(self.worker.block_timeout_ms),
            backoff: Duration::from_millis(self.worker.backoff_ms),
            max_deliveries: self.worker.max_deliveries,
            index_alias: self.worker.index_alias.clone(),
        }
    }

    /// Shutdown signal whose drain bound is `worker.shutdown_timeout_ms`.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal::with_timeout(Duration::from_millis(self.worker.shutdown_timeout_ms))
    }

    /// Build the fallback logger used by the ingestion hand-off.
    pub fn build_fallback_logger(&self) -> FallbackLogger {
        FallbackLogger::new(&self.fallback.dir)
            .with_max_file_size(self.fallback.max_file_size)
            .with_retention_days(self.fallback.retention_days)
    }

    /// Build the search index sink. Basic auth wins over an API key.
    pub fn build_search_sink(&self) -> Result<ElasticsearchSink, SinkError> {
        let es = &self.elasticsearch;
        let sink = ElasticsearchSink::new(&es.url)?
            .with_timeout(Duration::from_millis(es.timeout_ms))?
            .with_tls_verify(es.tls_verify)?;

        Ok(match (&es.username, &es.password, &es.api_key) {
            (Some(user), Some(pass), _) => sink.with_basic_auth(user, pass),
            (_, _, Some(key)) => sink.with_api_key(key),
            _ => sink,
        })
    }
}

fn parse_env<T: FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value,
    })
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
