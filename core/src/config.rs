//! Benchmark configuration types
//!
//! A run is described by one YAML file with four sections: `broker`,
//! `producer`, `consumer` and `shutdown`. Every key except the broker
//! identity has a default.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::destination::{self, DestinationError, Destinations, TopicTemplate};
use crate::transport::{ConnectOptions, Credentials, ProducerOptions, SubscribeOptions};

/// What a process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Producer workers only
    Produce,
    /// Consumer workers only
    Consume,
    /// Producers and consumers in one process
    Loopback,
}

impl Role {
    /// True if this role spawns producer workers
    pub fn produces(self) -> bool {
        matches!(self, Role::Produce | Role::Loopback)
    }

    /// True if this role spawns consumer workers
    pub fn consumes(self) -> bool {
        matches!(self, Role::Consume | Role::Loopback)
    }

    /// Lowercase name, used for log file names
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Produce => "producer",
            Role::Consume => "consumer",
            Role::Loopback => "loopback",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How producer workers hand messages to the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendMode {
    /// Blocking send; the worker waits for the broker
    #[serde(rename = "sync", alias = "Send")]
    Sync,
    /// Fire-and-forget send with a completion callback
    #[default]
    #[serde(rename = "async", alias = "SendAsync")]
    Async,
}

/// Complete benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Broker connection and destination identity
    pub broker: BrokerConfig,

    /// Producer role settings
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Consumer role settings
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Teardown settings
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Broker connection and destination identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address; the scheme selects the transport
    #[serde(default = "default_address")]
    pub address: String,

    /// Tenant name
    pub tenant: String,

    /// Single namespace or comma-separated list
    pub namespace: String,

    /// Topic name
    pub topic: String,

    /// Address template with `{tenant}`, `{namespace}`, `{topic}`
    #[serde(default = "default_topic_template")]
    pub topic_template: String,

    /// Token file name under `tokens_dir`; empty means no authentication
    #[serde(default)]
    pub token: String,

    /// Directory holding token files
    #[serde(default = "default_tokens_dir")]
    pub tokens_dir: PathBuf,

    /// Broker operation timeout in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Producer role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Number of producer workers
    pub threads: usize,

    /// Payload text carried in every envelope
    pub payload: String,

    /// Producer name passed to the transport; empty lets the broker pick
    pub production_name: String,

    /// Blocking or fire-and-forget sends
    pub send_mode: SendMode,

    /// Upper bound on a single blocking send
    pub send_timeout_ms: u64,

    /// Token bucket capacity per worker
    pub rate_burst: u32,

    /// Log every sent envelope
    pub log_detail: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            payload: String::new(),
            production_name: String::new(),
            send_mode: SendMode::default(),
            send_timeout_ms: 400,
            rate_burst: 1,
            log_detail: false,
        }
    }
}

/// Consumer role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of consumer workers
    pub threads: usize,

    /// Shared subscription name
    pub subscription_name: String,

    /// Log every received envelope
    pub log_detail: bool,

    /// Collect and emit per-tag latency stats
    pub log_counter: bool,

    /// Delay before a nacked message is redelivered
    pub nack_redelivery_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            subscription_name: "pubsub-bench".to_string(),
            log_detail: false,
            log_counter: true,
            nack_redelivery_delay_ms: 500,
        }
    }
}

/// Teardown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds to stay alive after cleanup so metrics can be scraped
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 120,
        }
    }
}

fn default_address() -> String {
    "memory://local".to_string()
}

fn default_topic_template() -> String {
    destination::DEFAULT_TOPIC_TEMPLATE.to_string()
}

fn default_tokens_dir() -> PathBuf {
    PathBuf::from("./tokens")
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

impl BenchConfig {
    /// Find the file for a config name
    ///
    /// An existing path is returned as-is; otherwise `<name>.yml` and then
    /// `<name>.yaml` are tried.
    pub fn locate(name: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
        let name = name.as_ref();
        if name.is_file() {
            return Ok(name.to_path_buf());
        }
        ["yml", "yaml"]
            .iter()
            .map(|ext| {
                let mut candidate = name.as_os_str().to_owned();
                candidate.push(".");
                candidate.push(ext);
                PathBuf::from(candidate)
            })
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ConfigError::NotFound(name.to_path_buf()))
    }

    /// Locate, read and parse a config by name
    pub fn load(name: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = Self::locate(name)?;
        Self::from_file(&path)
    }

    /// Read and parse a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse YAML text
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration for `role`
    ///
    /// `rate` is the CLI target rate; `None` means unlimited. Thread counts
    /// of zero are accepted and start no workers of that kind.
    pub fn validate(&self, role: Role, rate: Option<f64>) -> Result<(), ConfigError> {
        self.destinations()?;

        if role.produces() && self.producer.rate_burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        if role.consumes() && self.consumer.subscription_name.trim().is_empty() {
            return Err(ConfigError::EmptySubscription);
        }

        if let Some(rps) = rate {
            if rps <= 0.0 || !rps.is_finite() {
                return Err(ConfigError::InvalidRate(rps));
            }
        }

        Ok(())
    }

    /// Parsed topic template
    pub fn topic_template(&self) -> Result<TopicTemplate, DestinationError> {
        TopicTemplate::parse(&self.broker.topic_template)
    }

    /// Resolve the configured destinations
    pub fn destinations(&self) -> Result<Destinations, DestinationError> {
        destination::resolve(
            &self.broker.tenant,
            &self.broker.namespace,
            &self.broker.topic,
            &self.topic_template()?,
        )
    }

    /// Read the token file, if one is configured
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let name = self.broker.token.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let path = self.broker.tokens_dir.join(name);
        let token = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path, source })?;
        Ok(Some(Credentials::Token(token.trim().to_string())))
    }

    /// Client-level timeouts
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            operation_timeout: Duration::from_millis(self.broker.operation_timeout_ms),
            connection_timeout: Duration::from_millis(self.broker.connection_timeout_ms),
        }
    }

    /// Producer options for one destination address
    pub fn producer_options(&self, address: &str) -> ProducerOptions {
        let name = self.producer.production_name.trim();
        ProducerOptions {
            name: (!name.is_empty()).then(|| name.to_string()),
            send_timeout: Duration::from_millis(self.producer.send_timeout_ms),
            ..ProducerOptions::new(address)
        }
    }

    /// Shared subscription to every destination
    pub fn subscribe_options(&self, destinations: &Destinations) -> SubscribeOptions {
        SubscribeOptions {
            nack_redelivery_delay: Duration::from_millis(self.consumer.nack_redelivery_delay_ms),
            ..SubscribeOptions::shared(
                destinations.addresses(),
                self.consumer.subscription_name.clone(),
            )
        }
    }

    /// Grace period after cleanup
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_period_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No file matched the config name
    #[error("config '{0}' not found (tried as-is, .yml and .yaml)")]
    NotFound(PathBuf),

    /// A file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// YAML did not match the schema
    #[error("invalid config: {0}")]
    Parse(String),

    /// Destination settings are malformed
    #[error(transparent)]
    Destination(#[from] DestinationError),

    /// Token bucket capacity of zero
    #[error("rate_burst must be at least 1")]
    InvalidBurst,

    /// Target rate is not a positive number
    #[error("invalid rate {0}: must be positive and finite")]
    InvalidRate(f64),

    /// Consumer has no subscription name
    #[error("subscription_name must not be empty")]
    EmptySubscription,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
broker:
  tenant: bench
  namespace: ns1,ns2
  topic: latency
"#;

    fn minimal() -> BenchConfig {
        BenchConfig::from_yaml(MINIMAL).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.broker.address, "memory://local");
        assert_eq!(config.broker.topic_template, destination::DEFAULT_TOPIC_TEMPLATE);
        assert_eq!(config.broker.operation_timeout_ms, 30_000);
        assert_eq!(config.producer.threads, 1);
        assert_eq!(config.producer.send_mode, SendMode::Async);
        assert_eq!(config.producer.send_timeout_ms, 400);
        assert_eq!(config.producer.rate_burst, 1);
        assert!(config.consumer.log_counter);
        assert_eq!(config.consumer.nack_redelivery_delay_ms, 500);
        assert_eq!(config.shutdown.grace_period_secs, 120);
        assert!(config.credentials().unwrap().is_none());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
broker:
  address: memory://other
  tenant: t
  namespace: a
  topic: x
  topic_template: "{tenant}.{namespace}.{topic}"
producer:
  threads: 8
  payload: hello
  production_name: bench-producer
  send_mode: sync
  rate_burst: 4
  log_detail: true
consumer:
  threads: 2
  subscription_name: sub
  log_counter: false
shutdown:
  grace_period_secs: 0
"#;
        let config = BenchConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.producer.threads, 8);
        assert_eq!(config.producer.send_mode, SendMode::Sync);
        assert_eq!(config.producer.rate_burst, 4);
        assert!(!config.consumer.log_counter);
        assert_eq!(config.grace_period(), Duration::ZERO);

        let destinations = config.destinations().unwrap();
        assert_eq!(destinations.as_slice()[0].address, "t.t_a.x");

        let opts = config.producer_options("t.t_a.x");
        assert_eq!(opts.name.as_deref(), Some("bench-producer"));
        assert_eq!(opts.send_timeout, Duration::from_millis(400));
    }

    #[test]
    fn test_send_mode_aliases() {
        for (text, expected) in [
            ("sync", SendMode::Sync),
            ("Send", SendMode::Sync),
            ("async", SendMode::Async),
            ("SendAsync", SendMode::Async),
        ] {
            let mode: SendMode = serde_yaml::from_str(text).unwrap();
            assert_eq!(mode, expected, "{}", text);
        }
        assert!(serde_yaml::from_str::<SendMode>("Reflect").is_err());
    }

    #[test]
    fn test_missing_broker_identity_is_rejected() {
        let yaml = "broker:\n  tenant: t\n  topic: x\n";
        assert!(matches!(
            BenchConfig::from_yaml(yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_ok() {
        let config = minimal();
        for role in [Role::Produce, Role::Consume, Role::Loopback] {
            assert!(config.validate(role, Some(100.0)).is_ok());
            assert!(config.validate(role, None).is_ok());
        }
    }

    #[test]
    fn test_validate_accepts_zero_threads() {
        let mut config = minimal();
        config.producer.threads = 0;
        config.consumer.threads = 0;
        for role in [Role::Produce, Role::Consume, Role::Loopback] {
            assert!(config.validate(role, None).is_ok());
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<(&str, fn(&mut BenchConfig), Option<f64>)> = vec![
            ("empty tenant", |c| c.broker.tenant.clear(), None),
            ("empty entry", |c| c.broker.namespace = "a,,b".into(), None),
            (
                "no namespace placeholder",
                |c| c.broker.topic_template = "{tenant}/{topic}".into(),
                None,
            ),
            (
                "unknown placeholder",
                |c| c.broker.topic_template = "{tenant}/{namespace}/{topic}/{x}".into(),
                None,
            ),
            ("zero burst", |c| c.producer.rate_burst = 0, None),
            ("zero rate", |_| {}, Some(0.0)),
            ("negative rate", |_| {}, Some(-5.0)),
            ("infinite rate", |_| {}, Some(f64::INFINITY)),
        ];

        for (name, mutate, rate) in cases {
            let mut config = minimal();
            mutate(&mut config);
            assert!(config.validate(Role::Loopback, rate).is_err(), "{}", name);
        }
    }

    #[test]
    fn test_credentials_read_from_tokens_dir() {
        let dir = std::env::temp_dir().join(format!("pubsub-bench-token-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bench.jwt"), "secret-token\n").unwrap();

        let mut config = minimal();
        config.broker.token = "bench.jwt".into();
        config.broker.tokens_dir = dir.clone();
        assert_eq!(
            config.credentials().unwrap(),
            Some(Credentials::Token("secret-token".into()))
        );

        config.broker.token = "missing.jwt".into();
        assert!(matches!(
            config.credentials(),
            Err(ConfigError::Read { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_locate_tries_extensions() {
        let dir = std::env::temp_dir().join(format!("pubsub-bench-locate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bench.yaml"), MINIMAL).unwrap();

        let found = BenchConfig::locate(dir.join("bench")).unwrap();
        assert_eq!(found, dir.join("bench.yaml"));
        assert_eq!(BenchConfig::locate(&found).unwrap(), found);
        assert!(BenchConfig::load(dir.join("bench")).is_ok());
        assert!(matches!(
            BenchConfig::locate(dir.join("nope")),
            Err(ConfigError::NotFound(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_subscribe_options() {
        let config = minimal();
        let destinations = config.destinations().unwrap();
        let opts = config.subscribe_options(&destinations);
        assert_eq!(opts.topics.len(), 2);
        assert_eq!(opts.subscription_name, "pubsub-bench");
        assert_eq!(opts.nack_redelivery_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_role_flags() {
        assert!(Role::Produce.produces() && !Role::Produce.consumes());
        assert!(!Role::Consume.produces() && Role::Consume.consumes());
        assert!(Role::Loopback.produces() && Role::Loopback.consumes());
        assert_eq!(Role::Consume.to_string(), "consumer");
    }
}
