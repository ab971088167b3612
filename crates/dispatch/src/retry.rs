//! Retry policy for solver attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::solver::{SolverError, SolverErrorKind};

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt, if the ceiling allows
    Retryable,
    /// Settle the task as failed right away
    Terminal,
}

/// Configuration for solve retries
///
/// Supports exponential backoff with jitter so that a burst of failures does
/// not hammer the same site in lockstep.
///
/// # Example
///
/// ```
/// use turnstile_dispatch::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(250))
///     .with_non_retryable_error("invalid_sitekey");
///
/// assert!(policy.has_attempts_remaining(3));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "crate::duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10%
    pub jitter: f64,

    /// Retry attempts that ran past their deadline
    #[serde(default)]
    pub retry_on_timeout: bool,

    /// Error codes that are never retried, whatever their kind
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,

    /// Error codes that are always retried, whatever their kind
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff policy with sensible defaults
    ///
    /// - 3 max attempts
    /// - 500ms initial interval
    /// - 10 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    /// - timeouts are not retried
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            retry_on_timeout: false,
            non_retryable_errors: vec![],
            retryable_errors: vec![],
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retry_on_timeout: false,
            non_retryable_errors: vec![],
            retryable_errors: vec![],
        }
    }

    /// A policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retry_on_timeout: false,
            non_retryable_errors: vec![],
            retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Never retry errors carrying this code
    pub fn with_non_retryable_error(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_errors.push(code.into());
        self
    }

    /// Always retry errors carrying this code
    pub fn with_retryable_error(mut self, code: impl Into<String>) -> Self {
        self.retryable_errors.push(code.into());
        self
    }

    /// Calculate delay before a given attempt number (1-based)
    ///
    /// The first attempt runs immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        // Settings can arrive unchecked through serde; never let them panic here
        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && capped > 0.0 && capped.is_finite() {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            capped + jitter_offset
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max_interval)
    }

    /// Classify a solver failure
    ///
    /// Explicit code lists win over the kind the solver reported;
    /// `non_retryable_errors` wins over `retryable_errors`.
    pub fn classify(&self, error: &SolverError) -> FailureClass {
        if self.non_retryable_errors.iter().any(|c| c == &error.code) {
            return FailureClass::Terminal;
        }
        if self.retryable_errors.iter().any(|c| c == &error.code) {
            return FailureClass::Retryable;
        }
        match error.kind {
            SolverErrorKind::Transient => FailureClass::Retryable,
            SolverErrorKind::Permanent => FailureClass::Terminal,
        }
    }

    /// Check if there are remaining attempts after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}
