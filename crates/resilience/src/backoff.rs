//! Exponential backoff policy and retry classification
//!
//! The delay computation is a pure function of the attempt number, so it is
//! trivially testable and safe to share between concurrent callers. Whether
//! an error is worth retrying is a separate capability, expressed as a
//! predicate over the caller's error type rather than a type switch on
//! concrete provider errors.

use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, ConfigResult};

/// Maximum fraction of the capped delay added as jitter.
const JITTER_FRACTION: f64 = 0.3;

/// Backoff policy for retryable operations.
///
/// Immutable once built; owned by whichever executor or chain uses it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Number of retries after the initial attempt (total attempts is
    /// `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Upper bound on the computed delay, before jitter.
    pub max_interval: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Randomize delays to avoid synchronized retries across callers.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Create a configuration builder.
    pub fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder::new()
    }

    /// Validate the policy.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_interval.is_zero() {
            return Err(ConfigError::invalid("initial_interval must be greater than zero"));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::invalid("max_interval must be >= initial_interval"));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::invalid("multiplier must be a finite value >= 1"));
        }
        Ok(())
    }

    /// Compute the delay before the given retry attempt (1-based).
    ///
    /// `delay = min(initial * multiplier^(attempt-1), max_interval)`, plus a
    /// uniform random addition in `[0, 0.3 * delay]` when jitter is enabled.
    /// Attempt 0 gets no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial_interval.as_secs_f64() * exponent;
        let capped = raw.min(self.max_interval.as_secs_f64());

        let total = if self.jitter {
            capped + rand::thread_rng().gen_range(0.0..=capped * JITTER_FRACTION)
        } else {
            capped
        };

        Duration::from_secs_f64(total)
    }
}

/// Builder for [`BackoffPolicy`] with a fluent API.
#[derive(Debug, Default)]
pub struct BackoffPolicyBuilder {
    policy: BackoffPolicy,
}

impl BackoffPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: BackoffPolicy::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.policy.initial_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.policy.max_interval = interval;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.policy.jitter = false;
        self
    }

    pub fn build(self) -> ConfigResult<BackoffPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Capability for deciding whether an error is worth another attempt.
pub trait RetryClassifier<E> {
    /// Determine whether the error should trigger a retry.
    fn is_retryable(&self, error: &E) -> bool;
}

/// Retry on any error (the default when no classifier is configured).
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl<E> RetryClassifier<E> for RetryAll {
    fn is_retryable(&self, _error: &E) -> bool {
        true
    }
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryNone;

impl<E> RetryClassifier<E> for RetryNone {
    fn is_retryable(&self, _error: &E) -> bool {
        false
    }
}

/// Predicate-based classifier.
#[derive(Debug, Clone)]
pub struct RetryIf<F> {
    predicate: F,
}

impl<F> RetryIf<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F, E> RetryClassifier<E> for RetryIf<F>
where
    F: Fn(&E) -> bool,
{
    fn is_retryable(&self, error: &E) -> bool {
        (self.predicate)(error)
    }
}

/// Classifier that retries only errors whose extracted kind appears in a
/// configured set.
///
/// Matching is by category value, never by message text: the extractor maps
/// the caller's error to a comparable kind (typically a small enum), and the
/// classifier checks membership.
#[derive(Debug, Clone)]
pub struct RetryKinds<E, K> {
    extract: fn(&E) -> K,
    retryable: Vec<K>,
}

impl<E, K: PartialEq> RetryKinds<E, K> {
    pub fn new(extract: fn(&E) -> K, retryable: impl Into<Vec<K>>) -> Self {
        Self { extract, retryable: retryable.into() }
    }
}

impl<E, K: PartialEq> RetryClassifier<E> for RetryKinds<E, K> {
    fn is_retryable(&self, error: &E) -> bool {
        self.retryable.contains(&(self.extract)(error))
    }
}
