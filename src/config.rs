//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::http::KeySource;
use crate::ratelimit::{LimitScope, Quota};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

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
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum burst size per bucket
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Permits granted per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Per-client or global limiting
    #[serde(default)]
    pub scope: LimitScope,

    /// Where the client key comes from in per-client mode
    #[serde(default)]
    pub key_source: KeySource,

    /// Evict buckets idle for this many seconds; unset keeps them forever
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,

    /// Minimum seconds between two eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            scope: LimitScope::default(),
            key_source: KeySource::default(),
            idle_ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_capacity() -> f64 {
    10.0
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Idle window after which buckets may be evicted, if enabled.
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }

    /// Minimum time between two eviction sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Check the configuration for values that cannot be served.
    pub fn validate(&self) -> Result<()> {
        let rate_limiting = &self.rate_limiting;
        Quota::new(rate_limiting.capacity, rate_limiting.refill_rate)?;

        if rate_limiting.idle_ttl_secs.is_some() && rate_limiting.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "sweep_interval_secs must be greater than 0 when idle eviction is enabled"
                    .to_string(),
            ));
        }

        rate_limiting.key_source.validate()
    }
}
