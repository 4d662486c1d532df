//! Configuration management for Sluice.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SluiceError};
use crate::ratelimit::{
    BucketPolicy, KeyStrategy, DEFAULT_CAPACITY, DEFAULT_LEAK_RATE, DEFAULT_QUEUE_TIMEOUT,
};

/// Prefix for environment variable overrides, e.g. `SLUICE_LIMITER__CAPACITY`.
pub const ENV_PREFIX: &str = "SLUICE";

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Leaky bucket limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Burst size: requests admitted instantly before rejection begins
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Sustained admission rate in requests per second
    #[serde(default = "default_leak_rate")]
    pub leak_rate: f64,

    /// Waiters allowed per key when the bucket is full; 0 rejects immediately
    #[serde(default)]
    pub max_queue_size: usize,

    /// Longest time a queued request waits before it is rejected
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Evict drained buckets idle for this long; unset keeps every bucket
    #[serde(default)]
    pub idle_eviction_secs: Option<u64>,

    /// How guarded requests are partitioned into buckets
    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            leak_rate: default_leak_rate(),
            max_queue_size: 0,
            queue_timeout_ms: default_queue_timeout_ms(),
            idle_eviction_secs: None,
            key_strategy: KeyStrategy::default(),
        }
    }
}

fn default_capacity() -> f64 {
    DEFAULT_CAPACITY
}

fn default_leak_rate() -> f64 {
    DEFAULT_LEAK_RATE
}

fn default_queue_timeout_ms() -> u64 {
    DEFAULT_QUEUE_TIMEOUT.as_millis() as u64
}

impl LimiterConfig {
    /// Build the bucket policy, failing on non-positive parameters.
    pub fn policy(&self) -> Result<BucketPolicy> {
        BucketPolicy::new(self.capacity, self.leak_rate)
    }

    /// Queue timeout as a `Duration`.
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Idle eviction threshold, if eviction is enabled.
    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl SluiceConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `SLUICE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: SluiceConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SluiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a usable limiter.
    pub fn validate(&self) -> Result<()> {
        self.limiter.policy()?;
        if self.limiter.max_queue_size > 0 && self.limiter.queue_timeout_ms == 0 {
            return Err(SluiceError::Config(
                "queue_timeout_ms must be positive when queueing is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SluiceConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.limiter.capacity, 10.0);
        assert_eq!(config.limiter.leak_rate, 2.0);
        assert_eq!(config.limiter.max_queue_size, 0);
        assert_eq!(config.limiter.queue_timeout(), Duration::from_secs(5));
        assert_eq!(config.limiter.idle_eviction(), None);
        assert_eq!(config.limiter.key_strategy, KeyStrategy::Endpoint);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
limiter:
  capacity: 20
  leak_rate: 5
  max_queue_size: 20
  queue_timeout_ms: 3000
  idle_eviction_secs: 600
  key_strategy: endpoint_and_client
"#;
        let config = SluiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.limiter.capacity, 20.0);
        assert_eq!(config.limiter.leak_rate, 5.0);
        assert_eq!(config.limiter.max_queue_size, 20);
        assert_eq!(config.limiter.queue_timeout(), Duration::from_secs(3));
        assert_eq!(config.limiter.idle_eviction(), Some(Duration::from_secs(600)));
        assert_eq!(config.limiter.key_strategy, KeyStrategy::EndpointAndClient);
    }

    #[test]
    fn test_bundled_config_parses() {
        let config = SluiceConfig::from_yaml(include_str!("../config/sluice.yaml")).unwrap();
        assert_eq!(config.limiter.capacity, 10.0);
        assert_eq!(config.limiter.leak_rate, 2.0);
        assert_eq!(config.limiter.idle_eviction(), None);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = SluiceConfig::from_yaml("limiter:\n  capacity: 3\n").unwrap();
        assert_eq!(config.limiter.capacity, 3.0);
        assert_eq!(config.limiter.leak_rate, 2.0);
        assert_eq!(config.server.listen_addr.port(), 8080);
    }

    #[test]
    fn test_non_positive_parameters_rejected() {
        assert!(SluiceConfig::from_yaml("limiter:\n  capacity: 0\n").is_err());
        assert!(SluiceConfig::from_yaml("limiter:\n  leak_rate: -2\n").is_err());
    }

    #[test]
    fn test_unusable_parameters_rejected() {
        // a bucket smaller than one request would reject everything
        assert!(SluiceConfig::from_yaml("limiter:\n  capacity: 0.5\n").is_err());
        // too slow for the drain time to be represented
        assert!(SluiceConfig::from_yaml("limiter:\n  leak_rate: 1.0e-20\n").is_err());
    }

    #[test]
    fn test_queue_requires_timeout() {
        let yaml = "limiter:\n  max_queue_size: 5\n  queue_timeout_ms: 0\n";
        assert!(SluiceConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_idle_eviction_is_disabled() {
        let config = SluiceConfig::from_yaml("limiter:\n  idle_eviction_secs: 0\n").unwrap();
        assert_eq!(config.limiter.idle_eviction(), None);
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("sluice-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limiter:\n  capacity: 7\n  leak_rate: 1.5\n").unwrap();
        std::env::set_var("SLUICE_LIMITER__LEAK_RATE", "4");

        let config = SluiceConfig::load(Some(path.as_path()));
        std::env::remove_var("SLUICE_LIMITER__LEAK_RATE");
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.limiter.capacity, 7.0);
        assert_eq!(config.limiter.leak_rate, 4.0);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("sluice-config-does-not-exist.yaml");
        assert!(SluiceConfig::load(Some(path.as_path())).is_err());
    }
}
