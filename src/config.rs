//! Configuration types for usenet-idx
//!
//! Every setting has a default matching the original deployment, so an empty
//! JSON object or an empty environment yields a working configuration (apart
//! from the NNTP host).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Main configuration for the indexer
///
/// Fields are organized into logical sub-configs:
/// - [`server`](ServerConfig): NNTP endpoint and credentials
/// - [`groups`](GroupConfig): group list, wildcard, cap and ignore list
/// - [`ingest`](IngestConfig): batch and poll bounds for backpressure
/// - [`resilience`](ResilienceConfig): breaker thresholds, retry policy, timeouts
/// - [`reconcile`](ReconcileConfig): backfill schedule and staleness
/// - [`search`](SearchConfig): result limits and adult-content gating
/// - [`persistence`](PersistenceConfig): database location
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Groups to ingest
    #[serde(default)]
    pub groups: GroupConfig,

    /// Ingest loop bounds
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Circuit breaker, retry and timeout settings
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Reconciliation (backfill) settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Search and category gating
    #[serde(default)]
    pub search: SearchConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname
    #[serde(default)]
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    #[serde(default)]
    pub tls: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Number of pooled connections (default: 4)
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            tls: false,
            username: None,
            password: None,
            connections: default_connections(),
        }
    }
}

/// Group selection: literal names and wildcard patterns
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Literal group names or wildcard patterns (e.g. "alt.binaries.*")
    ///
    /// When empty, [`wildcard`](Self::wildcard) is used.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Fallback wildcard when no groups are configured (default: "alt.binaries.*")
    #[serde(default = "default_wildcard")]
    pub wildcard: String,

    /// Maximum number of groups a single wildcard expands to (default: 100)
    #[serde(default = "default_enumeration_cap")]
    pub enumeration_cap: usize,

    /// Groups (or wildcard patterns) never ingested
    #[serde(default)]
    pub ignore: Vec<String>,

    /// How often wildcard patterns are re-expanded (default: 1 hour)
    #[serde(default = "default_discovery_interval", with = "duration_serde")]
    pub discovery_interval: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            wildcard: default_wildcard(),
            enumeration_cap: default_enumeration_cap(),
            ignore: Vec::new(),
            discovery_interval: default_discovery_interval(),
        }
    }
}

impl GroupConfig {
    /// Patterns the ingest loop resolves each discovery round
    pub fn patterns(&self) -> Vec<String> {
        if self.groups.is_empty() {
            vec![self.wildcard.clone()]
        } else {
            self.groups.clone()
        }
    }
}

/// Ingest loop bounds for adaptive batch size and poll interval
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Smallest batch of headers fetched per cycle (default: 100)
    #[serde(default = "default_batch_min")]
    pub batch_min: u64,

    /// Largest batch of headers fetched per cycle (default: 1000)
    #[serde(default = "default_batch_max")]
    pub batch_max: u64,

    /// Shortest sleep between cycles for a group (default: 5 seconds)
    #[serde(default = "default_poll_min", with = "duration_serde")]
    pub poll_min: Duration,

    /// Longest sleep between cycles for a group (default: 60 seconds)
    #[serde(default = "default_poll_max", with = "duration_serde")]
    pub poll_max: Duration,

    /// Batch latency above which the loop backs off (default: 1200ms)
    #[serde(default = "default_latency_target", with = "millis_serde")]
    pub latency_target: Duration,

    /// Groups processed concurrently (default: 1)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Consecutive skipped cycles before a group is reported as failing (default: 3)
    #[serde(default = "default_failure_warn_threshold")]
    pub failure_warn_threshold: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_min: default_batch_min(),
            batch_max: default_batch_max(),
            poll_min: default_poll_min(),
            poll_max: default_poll_max(),
            latency_target: default_latency_target(),
            concurrency: default_concurrency(),
            failure_warn_threshold: default_failure_warn_threshold(),
        }
    }
}

/// Circuit breaker and retry settings shared by every guarded dependency
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures that open a breaker (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before admitting a probe (default: 30 seconds)
    #[serde(default = "default_reset_interval", with = "duration_serde")]
    pub reset_interval: Duration,

    /// Upper bound for any single guarded call (default: 30 seconds)
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub call_timeout: Duration,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_interval: default_reset_interval(),
            call_timeout: default_call_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 50ms)
    #[serde(default = "default_initial_delay", with = "millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 5 seconds)
    #[serde(default = "default_max_delay", with = "millis_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound of the random delay added to each backoff (default: 200ms)
    #[serde(default = "default_jitter", with = "millis_serde")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Reconciliation (backfill) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run the auto scan in the background (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between scheduled scans (default: 1 hour)
    #[serde(default = "default_reconcile_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Releases examined per scan page (default: 100)
    #[serde(default = "default_scan_batch")]
    pub scan_batch: u32,

    /// Age after which an unrecoverable release is pruned (default: 30 days)
    #[serde(default = "default_staleness", with = "duration_serde")]
    pub staleness: Duration,

    /// Largest article window re-queried for a single release (default: 5000)
    #[serde(default = "default_max_window")]
    pub max_window: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reconcile_interval(),
            scan_batch: default_scan_batch(),
            staleness: default_staleness(),
            max_window: default_max_window(),
        }
    }
}

/// Search limits and adult-content gating
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Hide the adult category tree regardless of `allow_xxx` (default: true)
    #[serde(default = "default_true")]
    pub safesearch: bool,

    /// Allow the adult category tree when safesearch is off (default: false)
    #[serde(default)]
    pub allow_xxx: bool,

    /// Largest page size (default: 100)
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,

    /// Largest offset (default: 10000)
    #[serde(default = "default_max_offset")]
    pub max_offset: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            safesearch: true,
            allow_xxx: false,
            max_limit: default_max_limit(),
            max_offset: default_max_offset(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./usenet-idx.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Config {
    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    ///
    /// Unset keys keep their defaults; set but unparseable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let env = EnvReader { lookup: &lookup };

        if let Some(host) = env.string("NNTP_HOST") {
            config.server.host = host;
        }
        if let Some(port) = env.parse("NNTP_PORT")? {
            config.server.port = port;
        }
        if let Some(tls) = env.flag("NNTP_SSL")? {
            config.server.tls = tls;
        }
        config.server.username = env.string("NNTP_USER").or(config.server.username);
        config.server.password = env.string("NNTP_PASS").or(config.server.password);
        if let Some(connections) = env.parse("NNTP_CONNECTIONS")? {
            config.server.connections = connections;
        }

        if let Some(groups) = env.list("NNTP_GROUPS") {
            config.groups.groups = groups;
        }
        if let Some(wildcard) = env.string("NNTP_GROUP_WILDCARD") {
            config.groups.wildcard = wildcard;
        }
        if let Some(ignore) = env.list("NNTP_IGNORE_GROUPS") {
            config.groups.ignore = ignore;
        }
        if let Some(cap) = env.parse("NNTP_GROUP_LIMIT")? {
            config.groups.enumeration_cap = cap;
        }

        if let Some(v) = env.parse("INGEST_BATCH_MIN")? {
            config.ingest.batch_min = v;
        }
        if let Some(v) = env.parse("INGEST_BATCH_MAX")? {
            config.ingest.batch_max = v;
        }
        if let Some(v) = env.parse("INGEST_POLL_MIN_SECONDS")? {
            config.ingest.poll_min = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("INGEST_POLL_MAX_SECONDS")? {
            config.ingest.poll_max = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("INGEST_DB_LATENCY_MS")? {
            config.ingest.latency_target = Duration::from_millis(v);
        }

        if let Some(v) = env.parse("CB_FAILURE_THRESHOLD")? {
            config.resilience.failure_threshold = v;
        }
        if let Some(v) = env.parse("CB_RESET_SECONDS")? {
            config.resilience.reset_interval = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("NNTP_TIMEOUT")? {
            config.resilience.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("RETRY_MAX")? {
            config.resilience.retry.max_retries = v;
        }
        if let Some(v) = env.parse("RETRY_BASE_MS")? {
            config.resilience.retry.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = env.parse("RETRY_JITTER_MS")? {
            config.resilience.retry.jitter = Duration::from_millis(v);
        }

        if let Some(days) = env.parse::<u64>("RECONCILE_STALE_DAYS")? {
            config.reconcile.staleness = Duration::from_secs(days * 86_400);
        }
        if let Some(v) = env.parse("RECONCILE_INTERVAL_SECONDS")? {
            config.reconcile.interval = Duration::from_secs(v);
        }

        if let Some(v) = env.flag("SAFESEARCH")? {
            config.search.safesearch = v;
        }
        if let Some(v) = env.flag("ALLOW_XXX")? {
            config.search.allow_xxx = v;
        }

        if let Some(path) = env.string("DATABASE_PATH") {
            config.persistence.database_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the ingest loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ingest.batch_min == 0 {
            return Err(config_error("batch_min must be at least 1", "ingest.batch_min"));
        }
        if self.ingest.batch_min > self.ingest.batch_max {
            return Err(config_error(
                "batch_min must not exceed batch_max",
                "ingest.batch_min",
            ));
        }
        if self.ingest.poll_min > self.ingest.poll_max {
            return Err(config_error(
                "poll_min must not exceed poll_max",
                "ingest.poll_min",
            ));
        }
        if self.ingest.concurrency == 0 {
            return Err(config_error(
                "concurrency must be at least 1",
                "ingest.concurrency",
            ));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(config_error(
                "failure_threshold must be at least 1",
                "resilience.failure_threshold",
            ));
        }
        if self.resilience.call_timeout.is_zero() {
            return Err(config_error(
                "call_timeout must be greater than zero",
                "resilience.call_timeout",
            ));
        }
        if self.resilience.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be at least 1.0",
                "resilience.retry.backoff_multiplier",
            ));
        }
        if self.groups.patterns().iter().all(|p| p.trim().is_empty()) {
            return Err(config_error("no groups configured", "groups.groups"));
        }
        if self.search.max_limit == 0 {
            return Err(config_error(
                "max_limit must be at least 1",
                "search.max_limit",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| config_error(&format!("invalid value '{}'", raw), key)),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        match self.string(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(config_error(&format!("invalid boolean '{}'", v), key)),
            },
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
    }
}

fn default_port() -> u16 {
    119
}

fn default_connections() -> usize {
    4
}

fn default_wildcard() -> String {
    "alt.binaries.*".to_string()
}

fn default_enumeration_cap() -> usize {
    100
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_batch_min() -> u64 {
    100
}

fn default_batch_max() -> u64 {
    1000
}

fn default_poll_min() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_max() -> Duration {
    Duration::from_secs(60)
}

fn default_latency_target() -> Duration {
    Duration::from_millis(1200)
}

fn default_concurrency() -> usize {
    1
}

fn default_failure_warn_threshold() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> Duration {
    Duration::from_millis(200)
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_scan_batch() -> u32 {
    100
}

fn default_staleness() -> Duration {
    Duration::from_secs(30 * 86_400)
}

fn default_max_window() -> u64 {
    5000
}

fn default_max_limit() -> u32 {
    100
}

fn default_max_offset() -> u32 {
    10_000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./usenet-idx.db")
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond-precision duration helper for retry delays and latency targets
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Conversion from our ServerConfig to nntp-rs's ServerConfig
impl From<ServerConfig> for nntp_rs::ServerConfig {
    fn from(config: ServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host,
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: false,
            username: config.username.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
        }
    }
}
