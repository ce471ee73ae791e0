use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Configuration for the telemetry gateway.
///
/// Loaded from a TOML file using [`Config::load`]. Environment variables with
/// the prefix `TELEMETRY_` override file keys, using `__` as the section
/// separator (e.g. `TELEMETRY_Kafka__BootstrapServers=broker:9092`). Key
/// matching is case-insensitive and ignores underscores, so C#-style
/// PascalCase names land on the snake_case TOML keys.
///
/// # Example
/// ```toml
/// [telemetry_server]
/// tcp_port = 8080
/// udp_port = 8081
/// buffer_size = 4096
/// max_connections = 5000
///
/// [kafka]
/// bootstrap_servers = "localhost:9092"
/// topic_prefix = "telemetry.gps"
/// partition_count = 8
///
/// [resilience.kafka]
/// max_attempts = 3
/// base_delay_ms = 1000
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ingress socket configuration.
    #[serde(default)]
    pub telemetry_server: TelemetryServerConfig,
    /// Bus producer configuration.
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Decoder plugin configuration.
    #[serde(default)]
    pub plugin_settings: PluginSettings,
    /// Retry/breaker policy parameters.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Service identification and stats reporting.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Ingress socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryServerConfig {
    /// TCP listener port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// UDP listener port.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Per-read pooled buffer size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum concurrent TCP sessions; accepts are refused beyond this.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Pipeline worker count. 0 selects the CPU count.
    #[serde(default)]
    pub worker_count: usize,
    /// Pipeline intake capacity as a multiple of `max_connections`.
    #[serde(default = "default_queue_capacity_factor")]
    pub queue_capacity_factor: usize,
}

fn default_tcp_port() -> u16 {
    8080
}
fn default_udp_port() -> u16 {
    8081
}
fn default_buffer_size() -> usize {
    4096
}
fn default_max_connections() -> usize {
    5000
}
fn default_queue_capacity_factor() -> usize {
    4
}

impl Default for TelemetryServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
            worker_count: 0,
            queue_capacity_factor: default_queue_capacity_factor(),
        }
    }
}

impl TelemetryServerConfig {
    /// Effective worker pool size.
    pub fn effective_workers(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    /// Total pipeline intake capacity across all shards.
    pub fn intake_capacity(&self) -> usize {
        (self.max_connections * self.queue_capacity_factor).max(self.effective_workers())
    }
}

/// Bus producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated broker list. Empty selects the in-memory bus (dev/tests).
    #[serde(default)]
    pub bootstrap_servers: String,
    /// Topic prefix; the protocol tag is appended lower-cased.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Producer compression codec: none, gzip, snappy, lz4, zstd.
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Producer linger in milliseconds (batching window).
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Maximum messages per producer batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Partition count used for the device partition key.
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
    /// Acknowledgement policy. The gateway requires full-ISR acks.
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Idempotent producer toggle.
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Client id reported to the broker and in message headers.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Per-message delivery timeout in milliseconds.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

fn default_topic_prefix() -> String {
    "telemetry.gps".to_string()
}
fn default_compression() -> String {
    "lz4".to_string()
}
fn default_linger_ms() -> u64 {
    5
}
fn default_batch_size() -> usize {
    10_000
}
fn default_partition_count() -> u32 {
    8
}
fn default_acks() -> String {
    "all".to_string()
}
fn default_true() -> bool {
    true
}
fn default_client_id() -> String {
    "gpsgate".to_string()
}
fn default_message_timeout_ms() -> u64 {
    30_000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            topic_prefix: default_topic_prefix(),
            compression: default_compression(),
            linger_ms: default_linger_ms(),
            batch_size: default_batch_size(),
            partition_count: default_partition_count(),
            acks: default_acks(),
            enable_idempotence: default_true(),
            client_id: default_client_id(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

/// Decoder plugin configuration.
///
/// Decoders are statically registered; `directory` and `enable_hot_reload`
/// are accepted for compatibility and logged, membership changes happen only
/// at quiescence through the registry's add/remove hooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Plugin directory (unused with static registration).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Hot-reload toggle (unused with static registration).
    #[serde(default)]
    pub enable_hot_reload: bool,
}

/// Per-policy retry/breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum attempts including the first.
    pub max_attempts: u32,
    /// Backoff shape: "exponential" or "linear".
    #[serde(default = "default_backoff")]
    pub backoff: String,
    /// Initial delay (exponential) or fixed step (linear), in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds (exponential only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Wall-clock bound over all attempts, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional circuit breaker guarding the wrapped operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerConfig>,
}

fn default_backoff() -> String {
    "exponential".to_string()
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure ratio that opens the breaker.
    pub failure_ratio: f64,
    /// Sampling window in seconds.
    pub window_secs: u64,
    /// Minimum outcomes in the window before the ratio is evaluated.
    pub min_throughput: u32,
    /// How long the breaker stays open before probing.
    pub break_secs: u64,
}

/// Retry/breaker policies for the publisher and reconnect paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Bus publish policy.
    #[serde(default = "default_kafka_policy")]
    pub kafka: PolicyConfig,
    /// Message processing policy.
    #[serde(default = "default_processing_policy")]
    pub processing: PolicyConfig,
    /// Endpoint reconnect policy.
    #[serde(default = "default_connection_policy")]
    pub connection: PolicyConfig,
}

fn default_kafka_policy() -> PolicyConfig {
    PolicyConfig {
        max_attempts: 3,
        backoff: "exponential".to_string(),
        base_delay_ms: 1_000,
        max_delay_ms: Some(30_000),
        timeout_ms: Some(30_000),
        breaker: Some(BreakerConfig {
            failure_ratio: 0.5,
            window_secs: 60,
            min_throughput: 10,
            break_secs: 30,
        }),
    }
}

fn default_processing_policy() -> PolicyConfig {
    PolicyConfig {
        max_attempts: 2,
        backoff: "linear".to_string(),
        base_delay_ms: 500,
        max_delay_ms: None,
        timeout_ms: Some(10_000),
        breaker: None,
    }
}

fn default_connection_policy() -> PolicyConfig {
    PolicyConfig {
        max_attempts: 5,
        backoff: "exponential".to_string(),
        base_delay_ms: 2_000,
        max_delay_ms: Some(60_000),
        timeout_ms: None,
        breaker: Some(BreakerConfig {
            failure_ratio: 0.7,
            window_secs: 120,
            min_throughput: 5,
            break_secs: 60,
        }),
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            kafka: default_kafka_policy(),
            processing: default_processing_policy(),
            connection: default_connection_policy(),
        }
    }
}

/// Service identification and stats reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name reported on the admin surface and in producer headers.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Admin HTTP port.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// Stats sampling interval in seconds. 0 disables the reporter.
    #[serde(default = "default_stats_sample_interval_secs")]
    pub stats_sample_interval_secs: u64,
    /// Stats history retention in seconds.
    #[serde(default = "default_stats_retention_secs")]
    pub stats_retention_secs: u64,
    /// Stats log output interval in seconds.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

fn default_service_name() -> String {
    "gpsgate".to_string()
}
fn default_admin_port() -> u16 {
    9090
}
fn default_stats_sample_interval_secs() -> u64 {
    1
}
fn default_stats_retention_secs() -> u64 {
    3600
}
fn default_stats_log_interval_secs() -> u64 {
    60
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            admin_port: default_admin_port(),
            stats_sample_interval_secs: default_stats_sample_interval_secs(),
            stats_retention_secs: default_stats_retention_secs(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

const ENV_PREFIX: &str = "TELEMETRY_";
const COMPRESSION_CODECS: [&str; 5] = ["none", "gzip", "snappy", "lz4", "zstd"];

impl Config {
    /// Loads the gateway configuration from a TOML file, applying
    /// `TELEMETRY_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a `GatewayError` if the file cannot be read or parsed, or if
    /// the configuration fails validation.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| GatewayError::filesystem(&path_str, e))?;
        Self::from_toml_str(&content, std::env::vars())
    }

    /// Parses a TOML document and applies environment overrides from the
    /// given iterator, then validates.
    ///
    /// The document and the overrides are layered over the built-in defaults,
    /// so a partial section (or an env-only override of one key) never
    /// leaves required sibling keys unset.
    pub fn from_toml_str(
        content: &str,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let file_value: toml::Value = toml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config file: {}", e)))?;

        let mut value = toml::Value::try_from(Config::default())
            .map_err(|e| GatewayError::config(format!("Default config serialization: {}", e)))?;
        deep_merge(&mut value, file_value);
        apply_env_overrides(&mut value, env);

        let config: Config = value
            .try_into()
            .map_err(|e| GatewayError::config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the loaded configuration for conflicting or out-of-range
    /// settings.
    pub fn validate(&self) -> Result<()> {
        let server = &self.telemetry_server;

        let mut ports = std::collections::HashSet::new();
        for (name, port) in [
            ("telemetry_server.tcp_port", server.tcp_port),
            ("telemetry_server.udp_port", server.udp_port),
            ("monitoring.admin_port", self.monitoring.admin_port),
        ] {
            if !ports.insert(port) {
                return Err(GatewayError::config(format!(
                    "Duplicate port {} ({})",
                    port, name
                )));
            }
        }

        if server.buffer_size < 256 {
            return Err(GatewayError::config(format!(
                "buffer_size too small: {} (must be >= 256)",
                server.buffer_size
            )));
        }
        if server.max_connections == 0 {
            return Err(GatewayError::config("max_connections must be >= 1"));
        }
        if server.queue_capacity_factor == 0 {
            return Err(GatewayError::config("queue_capacity_factor must be >= 1"));
        }

        if self.kafka.partition_count == 0 {
            return Err(GatewayError::config("kafka.partition_count must be >= 1"));
        }
        if !COMPRESSION_CODECS.contains(&self.kafka.compression.as_str()) {
            return Err(GatewayError::config(format!(
                "Unknown compression codec: {}",
                self.kafka.compression
            )));
        }
        if self.kafka.topic_prefix.is_empty() {
            return Err(GatewayError::config("kafka.topic_prefix must not be empty"));
        }

        for (name, policy) in [
            ("kafka", &self.resilience.kafka),
            ("processing", &self.resilience.processing),
            ("connection", &self.resilience.connection),
        ] {
            if policy.max_attempts == 0 {
                return Err(GatewayError::config(format!(
                    "resilience.{}.max_attempts must be >= 1",
                    name
                )));
            }
            if policy.backoff != "exponential" && policy.backoff != "linear" {
                return Err(GatewayError::config(format!(
                    "resilience.{}.backoff must be 'exponential' or 'linear'",
                    name
                )));
            }
            if let Some(breaker) = &policy.breaker {
                if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
                    return Err(GatewayError::config(format!(
                        "resilience.{}.breaker.failure_ratio must be in (0, 1]",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Recursively lays `overlay` over `base`; tables merge key-wise, scalars
/// and arrays replace.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match overlay {
        toml::Value::Table(overlay_table) => {
            if let toml::Value::Table(base_table) = base {
                for (key, value) in overlay_table {
                    match base_table.get_mut(&key) {
                        Some(slot) => deep_merge(slot, value),
                        None => {
                            base_table.insert(key, value);
                        }
                    }
                }
            } else {
                *base = toml::Value::Table(overlay_table);
            }
        }
        other => *base = other,
    }
}

/// Applies `TELEMETRY_Section__Key[__Key]` environment overrides onto the
/// parsed TOML document. Values are coerced to bool/int/float when they parse
/// as such, otherwise kept as strings.
fn apply_env_overrides(root: &mut toml::Value, env: impl IntoIterator<Item = (String, String)>) {
    for (key, raw) in env {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<&str> = rest.split("__").filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            continue;
        }

        set_nested_env_value(root, &segments, &raw);
    }
}

/// Recursive helper for `apply_env_overrides`: walks `segments` into `node`,
/// creating intermediate tables as needed, and sets the final segment's value.
fn set_nested_env_value(node: &mut toml::Value, segments: &[&str], raw: &str) {
    if segments.len() == 1 {
        if let Some(table) = node.as_table_mut() {
            let last = segments[0];
            let existing = table
                .keys()
                .find(|k| keys_match(k, last))
                .cloned()
                .unwrap_or_else(|| to_snake_case(last));
            table.insert(existing, coerce_env_value(raw));
        }
        return;
    }

    let Some(table) = node.as_table_mut() else {
        return;
    };
    let segment = segments[0];
    let existing = table
        .keys()
        .find(|k| keys_match(k, segment))
        .cloned()
        .unwrap_or_else(|| to_snake_case(segment));
    let next = table
        .entry(existing)
        .or_insert_with(|| toml::Value::Table(Default::default()));
    set_nested_env_value(next, &segments[1..], raw);
}

/// Case-insensitive, underscore-insensitive key comparison, so
/// `BootstrapServers` matches `bootstrap_servers`.
fn keys_match(a: &str, b: &str) -> bool {
    let norm = |s: &str| {
        s.chars()
            .filter(|c| *c != '_')
            .flat_map(|c| c.to_lowercase())
            .collect::<String>()
    };
    norm(a) == norm(b)
}

fn to_snake_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    for (i, c) in segment.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn coerce_env_value(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}
