use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::messaging::HeaderNames;
use crate::pipeline::{LocalRetryPolicy, RequeuePolicy, RetryPolicy};
use crate::utils::Backoff;

// ============================================================================
// Application Configuration
// ============================================================================
//
// Loaded from a YAML file and overridden by environment variables of the
// form APP__SECTION__KEY (for example APP__RETRY__MAX_RETRIES=5).
//
// ============================================================================

pub const DEFAULT_CONFIG_PATH: &str = "config/application.yaml";
const ENV_PREFIX: &str = "APP";
const ENV_SEPARATOR: &str = "__";

static IDENTIFIER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,47}$").expect("valid regex"));

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub broker: BrokerConfig,
    pub dead_letter: DeadLetterConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "message-ingest".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter directive, e.g. "info" or "info,message_ingest=debug"
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub nodes: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u32,
    pub table: String,
    pub dead_letter_table: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["127.0.0.1:9042".to_string()],
            keyspace: "ingest_ks".to_string(),
            replication_factor: 1,
            table: "users".to_string(),
            dead_letter_table: "dead_letter_queue".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Requeue cycles allowed before dead-lettering (with `limit_retry`)
    pub max_retries: u32,
    /// Base delay between local write attempts
    pub delay_ms: u64,
    /// Exponential growth for local delays; constant delay when unset
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: u64,
    pub limit_retry: bool,
    /// In-process write retries before escalating
    pub local_retries: u32,
    /// Explicit local delay schedule; overrides `local_retries` and `delay_ms`
    pub local_delays_ms: Vec<u64>,
    /// Push exhausted messages back to the broker instead of rejecting them
    pub requeue: bool,
    pub retry_count_header: String,
    pub first_seen_header: String,
    pub error_header: String,
    pub message_id_header: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let headers = HeaderNames::default();
        Self {
            max_retries: 3,
            delay_ms: 500,
            backoff_factor: None,
            max_delay_ms: 10_000,
            limit_retry: true,
            local_retries: 2,
            local_delays_ms: Vec::new(),
            requeue: true,
            retry_count_header: headers.retry_count,
            first_seen_header: headers.first_seen,
            error_header: headers.error,
            message_id_header: headers.message_id,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let local = if self.local_delays_ms.is_empty() {
            let delay = Duration::from_millis(self.delay_ms);
            let backoff = match self.backoff_factor {
                Some(factor) => {
                    Backoff::exponential(delay, factor, Duration::from_millis(self.max_delay_ms))
                }
                None => Backoff::constant(delay),
            };
            LocalRetryPolicy {
                retries: self.local_retries,
                backoff,
            }
        } else {
            LocalRetryPolicy {
                retries: self.local_delays_ms.len() as u32,
                backoff: Backoff::with_schedule(
                    self.local_delays_ms
                        .iter()
                        .map(|ms| Duration::from_millis(*ms))
                        .collect(),
                ),
            }
        };

        RetryPolicy {
            local,
            requeue: RequeuePolicy {
                enabled: self.requeue,
                max_retries: self.max_retries,
                limit_retry: self.limit_retry,
            },
        }
    }

    pub fn header_names(&self) -> HeaderNames {
        HeaderNames {
            retry_count: self.retry_count_header.clone(),
            first_seen: self.first_seen_header.clone(),
            error: self.error_header.clone(),
            message_id: self.message_id_header.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Offsets are committed by the client regardless of outcome
    Auto,
    /// Offsets are committed only for handled messages; failures are nacked
    #[default]
    Client,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    /// Requeue destination; the source topic when unset
    pub retry_topic: Option<String>,
    /// Destination for the `topic` dead-letter sink
    pub dead_letter_topic: Option<String>,
    pub ack_mode: AckMode,
    /// Independent subscriber loops in the same consumer group
    pub workers: usize,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "127.0.0.1:9092".to_string(),
            group_id: "message-ingest".to_string(),
            topic: "users".to_string(),
            retry_topic: None,
            dead_letter_topic: None,
            ack_mode: AckMode::Client,
            workers: 1,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30_000,
            send_timeout_ms: 5_000,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn retry_topic(&self) -> &str {
        self.retry_topic.as_deref().unwrap_or(&self.topic)
    }

    pub fn dead_letter_topic(&self) -> String {
        self.dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.topic))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_millis(self.initial_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterSinkKind {
    #[default]
    Table,
    Topic,
    Log,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub sink: DeadLetterSinkKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 2_000,
        }
    }
}

impl AppConfig {
    /// Load from `path` (optional on disk) plus `APP__` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path, "Loading configuration");
        Self::build(File::with_name(path).required(false), Self::environment(None))
    }

    /// Load from an in-memory YAML document and an explicit variable map.
    pub fn from_yaml(yaml: &str, env: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(
            File::from_str(yaml, FileFormat::Yaml),
            Self::environment(Some(env)),
        )
    }

    fn environment(source: Option<HashMap<String, String>>) -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(source)
    }

    fn build<S>(file: S, env: Environment) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let loaded: AppConfig = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.store.nodes.is_empty() {
            return invalid("store.nodes must list at least one node".into());
        }
        for (key, name) in [
            ("store.keyspace", &self.store.keyspace),
            ("store.table", &self.store.table),
            ("store.dead_letter_table", &self.store.dead_letter_table),
        ] {
            if !IDENTIFIER.is_match(name) {
                return invalid(format!("{key} '{name}' is not a valid CQL identifier"));
            }
        }
        if self.store.replication_factor == 0 {
            return invalid("store.replication_factor must be at least 1".into());
        }

        if self.broker.topic.trim().is_empty() {
            return invalid("broker.topic must not be empty".into());
        }
        if self.broker.brokers.trim().is_empty() {
            return invalid("broker.brokers must not be empty".into());
        }
        if self.broker.workers == 0 {
            return invalid("broker.workers must be at least 1".into());
        }
        if self.broker.reconnect.max_attempts == 0 {
            return invalid("broker.reconnect.max_attempts must be at least 1".into());
        }
        if !(self.broker.reconnect.multiplier >= 1.0) {
            return invalid("broker.reconnect.multiplier must be >= 1.0".into());
        }

        if let Some(factor) = self.retry.backoff_factor {
            if !(factor >= 1.0) {
                return invalid(format!("retry.backoff_factor must be >= 1.0, got {factor}"));
            }
        }
        let headers = self.retry.header_names();
        for (key, name) in [
            ("retry.retry_count_header", &headers.retry_count),
            ("retry.first_seen_header", &headers.first_seen),
            ("retry.error_header", &headers.error),
            ("retry.message_id_header", &headers.message_id),
        ] {
            if name.trim().is_empty() {
                return invalid(format!("{key} must not be empty"));
            }
        }

        if self.health.timeout_ms == 0 || self.health.interval_secs == 0 {
            return invalid("health.interval_secs and health.timeout_ms must be positive".into());
        }

        Ok(())
    }
}
