//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;

use crate::error::{Result, TollgateError};
use crate::ratelimit::policy::{PolicyRule, PolicyTable};
use crate::store::RetryPolicy;

/// Environment variable overriding the Redis connection URL.
const ENV_REDIS_URL: &str = "TOLLGATE_REDIS_URL";
/// Environment variable overriding the deployment environment.
const ENV_ENVIRONMENT: &str = "TOLLGATE_ENVIRONMENT";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
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
    "0.0.0.0:8080".parse().unwrap()
}

/// Which counter store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters; limits are per node.
    Memory,
    /// Shared Redis counters; limits are fleet-wide.
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Selected backend
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    pub redis_url: Option<String>,

    /// Prefix for store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for a single store round trip in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Base backoff before the single retry in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Sweep interval for the memory backend in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StoreConfig {
    /// The retry bounds for store round trips.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.request_timeout_ms),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// The sweep interval for the memory backend.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_key_prefix() -> String {
    "tollgate".to_string()
}

fn default_request_timeout_ms() -> u64 {
    150
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Deployment environment, used to relax ceilings outside production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Deployment environment
    #[serde(default = "default_environment")]
    pub environment: Environment,

    /// Ceiling multiplier applied outside production
    #[serde(default = "default_relaxation_factor")]
    pub relaxation_factor: u64,

    /// CIDR blocks whose traffic bypasses counting
    #[serde(default)]
    pub trusted_ips: Vec<IpNet>,

    /// Policy table overrides; empty means the built-in defaults
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            relaxation_factor: default_relaxation_factor(),
            trusted_ips: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl RateLimitingConfig {
    /// Build the validated policy table for this configuration.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        let mut table = if self.rules.is_empty() {
            PolicyTable::with_defaults()
        } else {
            PolicyTable::from_rules(&self.rules)?
        };
        if self.environment == Environment::Development {
            table.relax(self.relaxation_factor);
        }
        Ok(table)
    }
}

fn default_environment() -> Environment {
    Environment::Production
}

fn default_relaxation_factor() -> u64 {
    10
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|error| TollgateError::Config(error.to_string()))
    }

    /// Load configuration from an optional file, apply environment
    /// overrides, and validate.
    ///
    /// Validation failures are startup errors: the service refuses to run
    /// with undefined limiting behavior.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var(ENV_REDIS_URL) {
            self.store.redis_url = Some(url);
            self.store.backend = StoreBackend::Redis;
        }
        if let Ok(environment) = std::env::var(ENV_ENVIRONMENT) {
            self.rate_limiting.environment = match environment.as_str() {
                "production" => Environment::Production,
                "development" => Environment::Development,
                other => {
                    return Err(TollgateError::Config(format!(
                        "unknown environment: {other}"
                    )))
                }
            };
        }
        Ok(())
    }

    /// Validate the configuration eagerly.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(TollgateError::Config(
                "redis backend selected but no redis_url configured".to_string(),
            ));
        }
        if self.store.request_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store request timeout must be positive".to_string(),
            ));
        }
        if self.rate_limiting.relaxation_factor == 0 {
            return Err(TollgateError::Config(
                "relaxation factor must be positive".to_string(),
            ));
        }
        // Policy rules are validated by table construction.
        self.rate_limiting.policy_table().map(|_| ())
    }
}
