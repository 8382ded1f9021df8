//! Configuration types for inspector-engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound accepted for any configured delay or lifetime (one week)
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Engine configuration
///
/// Every field has a default, so an empty JSON object (`{}`) is a valid
/// configuration. Durations are expressed as (fractional) seconds when serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of work items processed per batch (default: 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Ceiling on concurrently running analysis tasks (default: 10)
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Ceiling on concurrently running downloads (default: 5)
    ///
    /// Downloads contend for bandwidth and disk rather than CPU, so this must not
    /// exceed `max_concurrent_tasks`.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Minimum spacing between throttled external calls (default: 1 second, 0 = unthrottled)
    #[serde(default = "default_rate_limit_delay", with = "duration_serde")]
    pub rate_limit_delay: Duration,

    /// Lifetime of cached call results (default: 300 seconds, must be non-zero)
    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub cache_ttl: Duration,

    /// Retry policy for transient download failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            rate_limit_delay: default_rate_limit_delay(),
            cache_ttl: default_cache_ttl(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON, then validate it
    ///
    /// ```
    /// use inspector_engine::config::EngineConfig;
    ///
    /// let config = EngineConfig::from_json(r#"{ "batch_size": 50, "rate_limit_delay": 0.5 }"#)?;
    /// assert_eq!(config.batch_size, 50);
    /// assert_eq!(config.max_concurrent_tasks, 10);
    /// # Ok::<(), inspector_engine::Error>(())
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contract violations
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key when a size, ceiling or
    /// `cache_ttl` is zero, when the download ceiling exceeds the analysis
    /// ceiling, when a duration exceeds [`MAX_DURATION`], or when the retry policy
    /// is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size", "batch_size must be at least 1"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::config(
                "max_concurrent_tasks",
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "max_concurrent_downloads",
                "max_concurrent_downloads must be at least 1",
            ));
        }
        if self.max_concurrent_downloads > self.max_concurrent_tasks {
            return Err(Error::config(
                "max_concurrent_downloads",
                format!(
                    "max_concurrent_downloads ({}) must not exceed max_concurrent_tasks ({})",
                    self.max_concurrent_downloads, self.max_concurrent_tasks
                ),
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(Error::config("cache_ttl", "cache_ttl must be greater than zero"));
        }
        check_duration("rate_limit_delay", self.rate_limit_delay)?;
        check_duration("cache_ttl", self.cache_ttl)?;
        self.retry.validate()
    }
}

fn check_duration(key: &str, value: Duration) -> Result<()> {
    if value > MAX_DURATION {
        return Err(Error::config(
            key,
            format!("{key} must not exceed {} seconds", MAX_DURATION.as_secs()),
        ));
    }
    Ok(())
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff_multiplier must be a finite number >= 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::config(
                "retry.initial_delay",
                "initial_delay must not exceed max_delay",
            ));
        }
        check_duration("retry.max_delay", self.max_delay)
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_max_concurrent_downloads() -> usize {
    5
}

fn default_rate_limit_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration as fractional seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
