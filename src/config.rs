//! Configuration for the aggregation engine
//!
//! Every section has a production `Default` and a `test()` preset with small
//! buffers and short timeouts. Configuration can be read from TOML and then
//! overridden from `RELAY_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | RELAY_SERVICE_NAME | coordinator.service_name |
//! | RELAY_TIMEOUT_GUARD_MS | coordinator.timeout_guard |
//! | RELAY_DELIVERY_RESERVE_MS | coordinator.delivery_reserve |
//! | RELAY_ARTIFACT_PREFIX | coordinator.artifact_prefix |
//! | RELAY_WORKER_COUNT | archiver.worker_count |
//! | RELAY_CHUNK_SIZE | archiver.chunk_size |
//! | RELAY_SPILL_THRESHOLD_BYTES | archiver.spill_threshold_bytes |
//! | RELAY_SPOOL_DIR | archiver.spool_dir |
//! | RELAY_IDEMPOTENCY_TTL_MS | idempotency.ttl |
//! | RELAY_FAILURE_THRESHOLD | breaker.failure_threshold |
//! | RELAY_COOLDOWN_MS | breaker.cooldown |
//! | RELAY_SINK_ENDPOINT | delivery.endpoint |
//! | RELAY_DIGEST_HEADER | delivery.digest_header |
//! | RELAY_CONNECT_TIMEOUT_MS | delivery.connect_timeout |
//! | RELAY_REQUEST_TIMEOUT_MS | delivery.request_timeout |
//! | RELAY_LOG_LEVEL | log.level |
//! | RELAY_LOG_JSON | log.json |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest chunk the archive writer may read at once
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration error
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(std::io::Error),
    /// TOML could not be parsed
    Parse(String),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub coordinator: CoordinatorConfig,
    pub archiver: ArchiverConfig,
    pub idempotency: IdempotencyConfig,
    pub breaker: BreakerConfig,
    pub delivery: DeliveryConfig,
    pub log: LogConfig,
}

impl RelayConfig {
    /// Configuration for tests (small buffers, short timeouts)
    pub fn test() -> Self {
        RelayConfig {
            coordinator: CoordinatorConfig::test(),
            archiver: ArchiverConfig::test(),
            idempotency: IdempotencyConfig::test(),
            breaker: BreakerConfig::test(),
            delivery: DeliveryConfig::test(),
            log: LogConfig::default(),
        }
    }

    /// Parse from TOML; missing sections and fields keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `RELAY_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAY_SERVICE_NAME") {
            self.coordinator.service_name = v;
        }
        if let Some(v) = lookup("RELAY_TIMEOUT_GUARD_MS") {
            self.coordinator.timeout_guard = parse_millis("RELAY_TIMEOUT_GUARD_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_DELIVERY_RESERVE_MS") {
            self.coordinator.delivery_reserve = parse_millis("RELAY_DELIVERY_RESERVE_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_ARTIFACT_PREFIX") {
            self.coordinator.artifact_prefix = v;
        }
        if let Some(v) = lookup("RELAY_WORKER_COUNT") {
            self.archiver.worker_count = parse_num("RELAY_WORKER_COUNT", &v)?;
        }
        if let Some(v) = lookup("RELAY_CHUNK_SIZE") {
            self.archiver.chunk_size = parse_num("RELAY_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("RELAY_SPILL_THRESHOLD_BYTES") {
            self.archiver.spill_threshold_bytes = parse_num("RELAY_SPILL_THRESHOLD_BYTES", &v)?;
        }
        if let Some(v) = lookup("RELAY_SPOOL_DIR") {
            self.archiver.spool_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RELAY_IDEMPOTENCY_TTL_MS") {
            self.idempotency.ttl = parse_millis("RELAY_IDEMPOTENCY_TTL_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_num("RELAY_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("RELAY_COOLDOWN_MS") {
            self.breaker.cooldown = parse_millis("RELAY_COOLDOWN_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_SINK_ENDPOINT") {
            self.delivery.endpoint = v;
        }
        if let Some(v) = lookup("RELAY_DIGEST_HEADER") {
            self.delivery.digest_header = v;
        }
        if let Some(v) = lookup("RELAY_CONNECT_TIMEOUT_MS") {
            self.delivery.connect_timeout = parse_millis("RELAY_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_REQUEST_TIMEOUT_MS") {
            self.delivery.request_timeout = parse_millis("RELAY_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RELAY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("RELAY_LOG_JSON") {
            self.log.json = v == "true" || v == "1";
        }
        self.validate()
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.archiver;
        if a.worker_count == 0 {
            return Err(ConfigError::Invalid("archiver.worker_count must be > 0".into()));
        }
        if a.chunk_size == 0 || a.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "archiver.chunk_size must be in 1..={}, got {}",
                MAX_CHUNK_SIZE, a.chunk_size
            )));
        }
        if !(a.fetch_timeout_fraction > 0.0 && a.fetch_timeout_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "archiver.fetch_timeout_fraction must be in (0, 1], got {}",
                a.fetch_timeout_fraction
            )));
        }
        if a.min_fetch_timeout > a.max_fetch_timeout {
            return Err(ConfigError::Invalid(
                "archiver.min_fetch_timeout exceeds max_fetch_timeout".into(),
            ));
        }
        if self.coordinator.timeout_guard.is_zero() {
            return Err(ConfigError::Invalid("coordinator.timeout_guard must be > 0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker.failure_threshold must be > 0".into()));
        }
        if self.breaker.max_cas_attempts == 0 {
            return Err(ConfigError::Invalid("breaker.max_cas_attempts must be > 0".into()));
        }
        if self.idempotency.shard_prefix_len == 0 || self.idempotency.shard_prefix_len > 64 {
            return Err(ConfigError::Invalid(
                "idempotency.shard_prefix_len must be in 1..=64".into(),
            ));
        }
        if self.delivery.endpoint.is_empty() {
            return Err(ConfigError::Invalid("delivery.endpoint must be set".into()));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} is not a number: {:?}", name, value)))
}

fn parse_millis(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_num::<u64>(name, value).map(Duration::from_millis)
}

/// Batch coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name of the downstream service; keys the shared breaker record
    pub service_name: String,
    /// Archiving time every accepted item is guaranteed. Intake stops once
    /// less than `timeout_guard + delivery_reserve` remains.
    #[serde(rename = "timeout_guard_ms", with = "duration_millis")]
    pub timeout_guard: Duration,
    /// Time held back from archiving for staging and delivery
    #[serde(rename = "delivery_reserve_ms", with = "duration_millis")]
    pub delivery_reserve: Duration,
    /// Key prefix for staged archive artifacts
    pub artifact_prefix: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            service_name: "downstream-sink".to_string(),
            timeout_guard: Duration::from_secs(10),
            delivery_reserve: Duration::from_secs(15),
            artifact_prefix: "archives".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Remaining time below which no further item is accepted
    pub fn intake_cutoff(&self) -> Duration {
        self.timeout_guard + self.delivery_reserve
    }

    pub fn test() -> Self {
        CoordinatorConfig {
            service_name: "test-sink".to_string(),
            timeout_guard: Duration::from_millis(50),
            delivery_reserve: Duration::from_millis(100),
            artifact_prefix: "test-archives".to_string(),
        }
    }
}

/// Compression method for archive entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveCompression {
    /// No compression
    Stored,
    #[default]
    Deflated,
    /// Zstd (requires feature)
    #[cfg(feature = "compression")]
    Zstd,
}

/// Streaming archiver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    /// Concurrent fetch workers; also the handle queue capacity
    pub worker_count: usize,
    /// Read size per chunk (at most 64 KiB)
    pub chunk_size: usize,
    /// Archive bytes kept in memory before spilling to a temp file
    pub spill_threshold_bytes: usize,
    /// Directory for spilled archives (system temp dir if unset)
    pub spool_dir: Option<PathBuf>,
    /// Share of the remaining time granted to one fetch
    pub fetch_timeout_fraction: f64,
    #[serde(rename = "min_fetch_timeout_ms", with = "duration_millis")]
    pub min_fetch_timeout: Duration,
    #[serde(rename = "max_fetch_timeout_ms", with = "duration_millis")]
    pub max_fetch_timeout: Duration,
    pub compression: ArchiveCompression,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        ArchiverConfig {
            worker_count: 8,
            chunk_size: MAX_CHUNK_SIZE,
            spill_threshold_bytes: 64 * 1024 * 1024, // 64MB
            spool_dir: None,
            fetch_timeout_fraction: 0.25,
            min_fetch_timeout: Duration::from_millis(250),
            max_fetch_timeout: Duration::from_secs(30),
            compression: ArchiveCompression::Deflated,
        }
    }
}

impl ArchiverConfig {
    pub fn test() -> Self {
        ArchiverConfig {
            worker_count: 4,
            chunk_size: 4 * 1024,
            spill_threshold_bytes: 256 * 1024, // 256KB
            spool_dir: None,
            fetch_timeout_fraction: 0.5,
            min_fetch_timeout: Duration::from_millis(20),
            max_fetch_timeout: Duration::from_secs(2),
            compression: ArchiveCompression::Deflated,
        }
    }

    /// Per-fetch timeout for the given remaining invocation time
    ///
    /// Shrinks with the remaining time, is floored at `min_fetch_timeout`
    /// and never exceeds what is actually left.
    pub fn fetch_timeout(&self, remaining: Duration) -> Duration {
        let scaled = remaining.mul_f64(self.fetch_timeout_fraction);
        scaled
            .clamp(self.min_fetch_timeout, self.max_fetch_timeout)
            .min(remaining)
    }
}

/// Idempotency filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Lifetime of an IN_PROGRESS claim; a crashed claim becomes reclaimable after it
    #[serde(rename = "ttl_ms", with = "duration_millis")]
    pub ttl: Duration,
    /// Lifetime of a COMPLETE record
    #[serde(rename = "completed_ttl_ms", with = "duration_millis")]
    pub completed_ttl: Duration,
    /// Hex characters of hash prefix used to shard dedup keys
    pub shard_prefix_len: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        IdempotencyConfig {
            ttl: Duration::from_secs(3600),                 // 1 hour
            completed_ttl: Duration::from_secs(7 * 24 * 3600), // 7 days
            shard_prefix_len: 4,
        }
    }
}

impl IdempotencyConfig {
    pub fn test() -> Self {
        IdempotencyConfig {
            ttl: Duration::from_secs(60),
            completed_ttl: Duration::from_secs(600),
            shard_prefix_len: 4,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time in OPEN before a trial delivery is allowed
    #[serde(rename = "cooldown_ms", with = "duration_millis")]
    pub cooldown: Duration,
    /// Conditional update attempts when recording an outcome
    pub max_cas_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            max_cas_attempts: 8,
        }
    }
}

impl BreakerConfig {
    pub fn test() -> Self {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            max_cas_attempts: 8,
        }
    }
}

/// HTTP method used for the sink transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryMethod {
    #[default]
    Put,
    Post,
}

/// Delivery client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Sink URL
    pub endpoint: String,
    pub method: DeliveryMethod,
    /// Header carrying the hex SHA-256 of the body
    pub digest_header: String,
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_ms", with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            endpoint: "http://127.0.0.1:8080/ingest".to_string(),
            method: DeliveryMethod::Put,
            digest_header: "x-content-sha256".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl DeliveryConfig {
    pub fn test() -> Self {
        DeliveryConfig {
            endpoint: "http://127.0.0.1:9/ingest".to_string(),
            method: DeliveryMethod::Put,
            digest_header: "x-content-sha256".to_string(),
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.archiver.chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(config.breaker.failure_threshold, 5);
        RelayConfig::test().validate().unwrap();
    }

    #[test]
    fn test_intake_cutoff_leaves_archive_time_after_reserve() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.intake_cutoff(), Duration::from_secs(25));
        assert!(config.intake_cutoff() > config.delivery_reserve);

        let mut relay = RelayConfig::test();
        relay.coordinator.timeout_guard = Duration::ZERO;
        assert!(matches!(relay.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [breaker]
            failure_threshold = 3
            cooldown_ms = 1500

            [delivery]
            endpoint = "https://sink.internal/upload"
            method = "POST"
            "#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown, Duration::from_millis(1500));
        assert_eq!(config.delivery.method, DeliveryMethod::Post);
        assert_eq!(config.archiver.worker_count, 8);
        assert_eq!(config.delivery.digest_header, "x-content-sha256");
    }

    #[test]
    fn test_toml_rejects_oversized_chunk() {
        let err = RelayConfig::from_toml_str("[archiver]\nchunk_size = 131072\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[archiver]\nworker_count = 2\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.archiver.worker_count, 2);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_WORKER_COUNT", "16"),
            ("RELAY_COOLDOWN_MS", "250"),
            ("RELAY_SINK_ENDPOINT", "http://sink:9000/in"),
            ("RELAY_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.archiver.worker_count, 16);
        assert_eq!(config.breaker.cooldown, Duration::from_millis(250));
        assert_eq!(config.delivery.endpoint, "http://sink:9000/in");
        assert!(config.log.json);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = RelayConfig::default();
        let err = config
            .apply_env_from(|k| (k == "RELAY_WORKER_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_fetch_timeout_shrinks_with_remaining_time() {
        let config = ArchiverConfig::default();

        // 25% of 60s = 15s
        assert_eq!(config.fetch_timeout(Duration::from_secs(60)), Duration::from_secs(15));
        // Capped at max
        assert_eq!(config.fetch_timeout(Duration::from_secs(600)), Duration::from_secs(30));
        // Floored at min
        assert_eq!(config.fetch_timeout(Duration::from_millis(800)), Duration::from_millis(250));
        // Never more than what is left
        assert_eq!(config.fetch_timeout(Duration::from_millis(100)), Duration::from_millis(100));
    }

    #[test]
    fn test_config_json_roundtrip_uses_millis() {
        let config = BreakerConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["cooldown_ms"], 60_000);
    }
}
