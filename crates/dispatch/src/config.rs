//! Dispatcher configuration
//!
//! Everything tunable about the dispatch core lives in [`DispatcherConfig`].
//! Values come from code (builder methods) or from environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::WorkerPoolConfig;
use crate::retry::RetryPolicy;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a [`Dispatcher`](crate::Dispatcher)
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use turnstile_dispatch::DispatcherConfig;
///
/// let config = DispatcherConfig::default()
///     .with_worker_count(4)
///     .with_admission_ceiling(200)
///     .with_attempt_timeout(Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Worker pool settings (slots, deadlines, retry policy)
    pub pool: WorkerPoolConfig,

    /// Maximum outstanding (PENDING + RUNNING) tasks
    pub admission_ceiling: usize,

    /// How long terminal tasks stay queryable
    #[serde(with = "crate::duration_millis")]
    pub retention_ttl: Duration,

    /// Period of the eviction sweep
    #[serde(with = "crate::duration_millis")]
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            admission_ceiling: 100,
            retention_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.pool.worker_count = count;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.pool.attempt_timeout = timeout;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.pool.launch_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.pool.close_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.pool.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.pool.retry = retry;
        self
    }

    pub fn with_admission_ceiling(mut self, ceiling: usize) -> Self {
        self.admission_ceiling = ceiling;
        self
    }

    pub fn with_retention_ttl(mut self, ttl: Duration) -> Self {
        self.retention_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.worker_count == 0 {
            return Err(ConfigError::Invalid("worker count must be at least 1".into()));
        }
        if self.admission_ceiling == 0 {
            return Err(ConfigError::Invalid(
                "admission ceiling must be at least 1".into(),
            ));
        }
        if self.pool.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("max attempts must be at least 1".into()));
        }
        if self.pool.attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid("attempt timeout must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep interval must be non-zero".into()));
        }
        let retry = &self.pool.retry;
        if !retry.backoff_coefficient.is_finite() || retry.backoff_coefficient < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff coefficient must be at least 1.0, got {}",
                retry.backoff_coefficient
            )));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "jitter must be within 0.0-1.0, got {}",
                retry.jitter
            )));
        }
        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `THREADS`: worker slots (default: 2)
    /// - `MAX_CONNECTIONS`: admission ceiling (default: 100)
    /// - `SOLVE_TIMEOUT_SECS`: per-attempt deadline (default: 60)
    /// - `MAX_ATTEMPTS`: attempts per task, including the first (default: 3)
    /// - `RETRY_INITIAL_MS`: first retry backoff (default: 500)
    /// - `RETRY_ON_TIMEOUT`: retry attempts that timed out (default: false)
    /// - `NON_RETRYABLE_ERRORS`: comma-separated solver codes never retried
    /// - `RETRYABLE_ERRORS`: comma-separated solver codes always retried
    /// - `RESULT_TTL_SECS`: retention after a terminal state (default: 600)
    /// - `SWEEP_INTERVAL_SECS`: eviction sweep period (default: 30)
    /// - `SHUTDOWN_TIMEOUT_SECS`: drain bound on shutdown (default: 90)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(lookup);

        let mut retry = defaults.pool.retry.clone();
        if let Some(n) = env.parse::<u32>("MAX_ATTEMPTS")? {
            retry.max_attempts = n;
        }
        if let Some(ms) = env.parse::<u64>("RETRY_INITIAL_MS")? {
            retry.initial_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = env.flag("RETRY_ON_TIMEOUT")? {
            retry.retry_on_timeout = flag;
        }
        if let Some(codes) = env.list("NON_RETRYABLE_ERRORS") {
            retry.non_retryable_errors = codes;
        }
        if let Some(codes) = env.list("RETRYABLE_ERRORS") {
            retry.retryable_errors = codes;
        }

        let mut pool = defaults.pool.clone().with_retry(retry);
        if let Some(n) = env.parse::<usize>("THREADS")? {
            pool.worker_count = n;
        }
        if let Some(secs) = env.parse::<u64>("SOLVE_TIMEOUT_SECS")? {
            pool.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("SHUTDOWN_TIMEOUT_SECS")? {
            pool.shutdown_timeout = Duration::from_secs(secs);
        }

        let config = Self {
            pool,
            admission_ceiling: env
                .parse::<usize>("MAX_CONNECTIONS")?
                .unwrap_or(defaults.admission_ceiling),
            retention_ttl: env
                .parse::<u64>("RESULT_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention_ttl),
            sweep_interval: env
                .parse::<u64>("SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        };

        config.validate()?;
        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|raw| match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: "expected true or false".into(),
                }),
            })
            .transpose()
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}
