//! Configuration management for Turnstile.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::sliding_window::DEFAULT_FLUSH_INTERVAL;
use crate::ratelimit::{Algorithm, FailurePolicy};
use crate::wire::DEFAULT_MAX_LINE_BYTES;

/// Prefix of environment variables overriding file settings, e.g.
/// `TURNSTILE__RATE_LIMITING__LIMIT=50`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
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
    /// Admission server address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Longest accepted request line in bytes
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_line_bytes == 0 {
            return Err(TurnstileError::Config(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9090))
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// When false every request is admitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub algorithm: Algorithm,

    /// Requests per window, bucket capacity or queue depth
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window, interval, refill interval or leak rate in milliseconds.
    /// Defaults depend on the algorithm.
    #[serde(default)]
    pub window_ms: Option<u64>,

    /// Sliding window store sweep interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Sliding window entry lifetime, twice the window when unset
    #[serde(default)]
    pub expiration_ms: Option<u64>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Delay admitted leaky bucket requests until their scheduled slot
    #[serde(default)]
    pub honor_delay: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            algorithm: Algorithm::default(),
            limit: default_limit(),
            window_ms: None,
            flush_interval_ms: default_flush_interval_ms(),
            expiration_ms: None,
            failure_policy: FailurePolicy::default(),
            honor_delay: false,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_limit() -> u64 {
    100
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL.as_millis() as u64
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        self.window_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.algorithm.default_window())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn expiration(&self) -> Duration {
        self.expiration_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.window().saturating_mul(2))
    }

    /// Reject settings no limiter could be built from.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == Some(0) {
            return Err(TurnstileError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(TurnstileError::Config(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        // A zero maximum is meaningful only for the sliding window counter
        if self.limit == 0 && self.algorithm != Algorithm::SlidingWindow {
            return Err(TurnstileError::Config(format!(
                "limit must be greater than zero for {}",
                self.algorithm
            )));
        }
        if self.algorithm == Algorithm::SlidingWindow
            && self.expiration() < self.window().saturating_mul(2)
        {
            return Err(TurnstileError::Config(format!(
                "expiration_ms must be at least twice the window ({} ms)",
                self.window().as_millis()
            )));
        }
        Ok(())
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.server.validate()?;
        config.rate_limiting.validate()?;
        Ok(config)
    }

    /// Layer an optional config file under `TURNSTILE__*` environment
    /// variables. Missing settings take their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.server.validate()?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}
