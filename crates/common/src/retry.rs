//! Retry policy: attempt budget, backoff schedule and retryable predicate
//!
//! A policy is immutable once built and cheap to clone, so one instance can
//! be shared by every concurrently running session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{AttemptError, Error, Result};

/// Decides whether a failed attempt may be retried
pub type RetryPredicate = Arc<dyn Fn(&AttemptError) -> bool + Send + Sync>;

/// Retry every failure
pub fn retry_all() -> RetryPredicate {
    Arc::new(|_| true)
}

/// Never retry
pub fn retry_none() -> RetryPredicate {
    Arc::new(|_| false)
}

/// Retry everything except per-attempt timeouts
pub fn skip_timeouts() -> RetryPredicate {
    Arc::new(|err| !matches!(err, AttemptError::Timeout(_)))
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Option<Duration>,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("retryable", &"<predicate>")
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            max_delay: None,
            retryable: retry_all(),
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Build a policy from the `[retry]` config section
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .max_attempts(config.max_attempts)
            .base_delay(Duration::from_millis(config.base_delay_ms))
            .backoff_multiplier(config.backoff_multiplier);

        if let Some(max_delay_ms) = config.max_delay_ms {
            builder = builder.max_delay(Duration::from_millis(max_delay_ms));
        }

        if !config.retry_timeouts {
            builder = builder.retryable(skip_timeouts());
        }

        builder.build()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Whether attempt `attempt` (1-based) may be followed by another one
    pub fn should_retry(&self, attempt: u32, error: &AttemptError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        (self.retryable)(error)
    }

    /// Delay to wait before starting attempt `attempt` (1-based).
    ///
    /// Zero for the first attempt, `base_delay * multiplier^(attempt - 2)`
    /// afterwards. Saturates at the configured cap, or at the largest
    /// representable delay when no cap is set.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            Duration::from_nanos(u64::MAX)
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Builder for [`RetryPolicy`]; `build` validates the settings
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, cap: Duration) -> Self {
        self.policy.max_delay = Some(cap);
        self
    }

    pub fn retryable(mut self, predicate: RetryPredicate) -> Self {
        self.policy.retryable = predicate;
        self
    }

    pub fn build(self) -> Result<RetryPolicy> {
        if self.policy.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let multiplier = self.policy.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff_multiplier must be a finite value >= 1.0 (got {})",
                multiplier
            )));
        }
        Ok(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AcquisitionError, BodyError};
    use test_case::test_case;

    fn doubling() -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_millis(100))
            .backoff_multiplier(2.0)
            .build()
            .unwrap()
    }

    #[test_case(0, 0 ; "attempt zero")]
    #[test_case(1, 0 ; "first attempt")]
    #[test_case(2, 100 ; "second attempt")]
    #[test_case(3, 200 ; "third attempt")]
    #[test_case(4, 400 ; "fourth attempt")]
    fn test_doubling_schedule(attempt: u32, expected_ms: u64) {
        assert_eq!(
            doubling().delay_before_attempt(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_constant_schedule_by_default() {
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .base_delay(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_millis(250));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::builder()
            .max_attempts(10)
            .base_delay(Duration::from_millis(100))
            .backoff_multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(policy.delay_before_attempt(3), Duration::from_secs(1));
        assert_eq!(policy.delay_before_attempt(4), Duration::from_secs(2));
        assert_eq!(policy.delay_before_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_uncapped_delay_saturates() {
        let policy = RetryPolicy::builder()
            .max_attempts(u32::MAX)
            .base_delay(Duration::from_secs(1))
            .backoff_multiplier(1000.0)
            .build()
            .unwrap();
        assert_eq!(policy.delay_before_attempt(500), Duration::from_nanos(u64::MAX));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = doubling();
        let err = AttemptError::from(BodyError::assertion("boom"));
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(4, &err));
        assert!(!policy.should_retry(5, &err));
        assert!(!policy.should_retry(6, &err));
    }

    #[test]
    fn test_non_retryable_short_circuits() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .retryable(retry_none())
            .build()
            .unwrap();
        let err = AttemptError::from(AcquisitionError::new("browser", "no display"));
        assert!(!policy.should_retry(1, &err));
    }

    #[test]
    fn test_skip_timeouts_predicate() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .retryable(skip_timeouts())
            .build()
            .unwrap();
        assert!(!policy.should_retry(1, &AttemptError::Timeout(Duration::from_secs(1))));
        assert!(policy.should_retry(1, &AttemptError::from(BodyError::error("flaky"))));
    }

    #[test]
    fn test_default_policy_tries_once() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1, &AttemptError::from(BodyError::error("x"))));
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder().backoff_multiplier(0.5).build().is_err());
        assert!(RetryPolicy::builder()
            .backoff_multiplier(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_delay_ms: Some(75),
            retry_timeouts: false,
        };
        let policy = RetryPolicy::from_config(&config).unwrap();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(50));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_millis(75));
        assert!(!policy.should_retry(1, &AttemptError::Timeout(Duration::from_millis(10))));
    }
}
