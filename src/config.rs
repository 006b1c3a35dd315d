use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{RateThrottleError, Result};

/// Engine-level policy knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Admit requests when the backend is unreachable. When false the
    /// engine fails closed: denied with `retry_after = 1`.
    pub fail_open: bool,

    /// Capacity of the recent-violations ring.
    pub violation_capacity: usize,

    /// Run the traffic analyzer synchronously inside `check` instead of
    /// on a detached task. Intended for tests.
    pub inline_analyzer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            violation_capacity: 1000,
            inline_analyzer: false,
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fail_open: std::env::var("RATETHROTTLE_FAIL_OPEN")
                .map(|v| v != "0")
                .unwrap_or(defaults.fail_open),
            ..defaults
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: usize,

    /// Connection timeout in seconds.
    pub connection_timeout_secs: u64,

    /// Per-command timeout; elapsed commands surface as
    /// `BackendUnavailable`.
    pub command_timeout: Duration,

    /// Namespace prefix prepended to every key.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout: Duration::from_secs(5),
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    /// Load Redis configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("RATETHROTTLE_REDIS_URL").unwrap_or(defaults.url),

            max_connections: std::env::var("RATETHROTTLE_REDIS_MAX_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),

            connection_timeout_secs: std::env::var("RATETHROTTLE_REDIS_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connection_timeout_secs),

            command_timeout: std::env::var("RATETHROTTLE_BACKEND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),

            key_prefix: std::env::var("RATETHROTTLE_REDIS_KEY_PREFIX")
                .unwrap_or(defaults.key_prefix),
        }
    }
}

/// Validate Redis configuration
pub fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(RateThrottleError::ConfigurationError(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(RateThrottleError::ConfigurationError(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(RateThrottleError::ConfigurationError(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 {
        return Err(RateThrottleError::ConfigurationError(
            "connection_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if config.command_timeout.is_zero() {
        return Err(RateThrottleError::ConfigurationError(
            "command_timeout must be greater than 0".to_string(),
        ));
    }

    debug!("Redis configuration valid");
    Ok(())
}

/// Weight each traffic signal contributes to the suspicion score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    /// Request rate above the configured threshold.
    pub rate: f64,
    /// Endpoint diversity above `max_unique_endpoints` (scanning).
    pub endpoints: f64,
    /// Burst count above `burst_threshold`.
    pub burst: f64,
    /// Minimum inter-arrival gap below `min_interval_threshold`
    /// (bot regularity).
    pub interarrival: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            rate: 0.35,
            endpoints: 0.25,
            burst: 0.20,
            interarrival: 0.20,
        }
    }
}

/// Traffic-analyzer thresholds and signal weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// A disabled analyzer records nothing and reports every pattern as
    /// non-suspicious.
    pub enabled: bool,

    /// Requests per analysis window above which the rate signal fires.
    pub threshold: u64,

    /// Analysis window length in seconds.
    pub window: f64,

    /// Write suspicious identifiers to the deny list automatically.
    pub auto_block: bool,

    /// Deny duration (seconds) for auto-blocked identifiers.
    pub block_duration: f64,

    /// Suspicion score at or above which a pattern is suspicious.
    pub suspicious_threshold: f64,

    /// Endpoint diversity above which the scanning signal fires.
    pub max_unique_endpoints: usize,

    /// Requests within `burst_window` above which the burst signal fires.
    pub burst_threshold: u64,

    /// Sub-window length (seconds) for burst detection.
    pub burst_window: f64,

    /// Minimum inter-arrival gap (seconds) below which the regularity
    /// signal fires.
    pub min_interval_threshold: f64,

    /// Per-identifier sample cap.
    pub max_samples: usize,

    #[serde(default)]
    pub weights: SignalWeights,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 10_000,
            window: 60.0,
            auto_block: true,
            block_duration: 3600.0,
            suspicious_threshold: 0.5,
            max_unique_endpoints: 50,
            burst_threshold: 100,
            burst_window: 10.0,
            min_interval_threshold: 0.1,
            max_samples: 10_000,
            weights: SignalWeights::default(),
        }
    }
}

/// Validate analyzer configuration
pub fn validate_analyzer_config(config: &AnalyzerConfig) -> Result<()> {
    if config.threshold == 0 {
        return Err(RateThrottleError::ConfigurationError(
            "analyzer threshold must be positive".to_string(),
        ));
    }

    if config.window <= 0.0 {
        return Err(RateThrottleError::ConfigurationError(format!(
            "analyzer window must be positive, got {}",
            config.window
        )));
    }

    if !(0.0..=1.0).contains(&config.suspicious_threshold) {
        return Err(RateThrottleError::ConfigurationError(format!(
            "suspicious_threshold must be 0-1, got {}",
            config.suspicious_threshold
        )));
    }

    if config.block_duration < 0.0 {
        return Err(RateThrottleError::ConfigurationError(format!(
            "block_duration cannot be negative, got {}",
            config.block_duration
        )));
    }

    if config.burst_window <= 0.0 || config.burst_window > config.window {
        return Err(RateThrottleError::ConfigurationError(format!(
            "burst_window must be within (0, window], got {}",
            config.burst_window
        )));
    }

    if config.max_samples == 0 {
        return Err(RateThrottleError::ConfigurationError(
            "max_samples must be positive".to_string(),
        ));
    }

    let weights = [
        config.weights.rate,
        config.weights.endpoints,
        config.weights.burst,
        config.weights.interarrival,
    ];
    if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
        return Err(RateThrottleError::ConfigurationError(
            "signal weights must each be within [0, 1]".to_string(),
        ));
    }

    debug!("Analyzer configuration valid");
    Ok(())
}
