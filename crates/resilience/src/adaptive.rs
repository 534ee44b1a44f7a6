//! Adaptive rate limiter reacting to upstream throttling signals
//!
//! Wraps a token bucket with a backoff window set when the dependency itself
//! says "slow down" (HTTP 429 / Retry-After). While the window is active,
//! blocking waits sleep it out before consulting the bucket and non-blocking
//! admission is denied outright.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::retry::sleep_cancellable;

/// Rate limiter that honors upstream backoff demands.
pub struct AdaptiveRateLimiter<C: Clock = SystemClock> {
    inner: RateLimiter<C>,
    backoff_until: Arc<RwLock<Option<Instant>>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for AdaptiveRateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            backoff_until: Arc::clone(&self.backoff_until),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl AdaptiveRateLimiter<SystemClock> {
    /// Create an adaptive limiter with the system clock.
    pub fn new(config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> AdaptiveRateLimiter<C> {
    /// Create an adaptive limiter with a custom clock (useful for testing).
    pub fn with_clock(config: RateLimitConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let clock = Arc::new(clock);
        Ok(Self {
            inner: RateLimiter::from_validated(config, Arc::clone(&clock)),
            backoff_until: Arc::new(RwLock::new(None)),
            clock,
        })
    }

    /// Record an upstream throttling signal.
    ///
    /// Subsequent admissions honor the backoff window; overlapping signals
    /// keep the furthest deadline.
    pub fn on_rate_limit_error(&self, retry_after: Duration) {
        let until = self.clock.now() + retry_after;
        if let Ok(mut guard) = self.backoff_until.write() {
            let extended = match *guard {
                Some(existing) => existing.max(until),
                None => until,
            };
            *guard = Some(extended);
        }
        warn!(?retry_after, "upstream signalled throttling, backing off");
    }

    /// Time left in the backoff window, if one is active.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let until = match self.backoff_until.read() {
            Ok(guard) => (*guard)?,
            Err(poisoned) => (*poisoned.into_inner())?,
        };
        let now = self.clock.now();
        (until > now).then(|| until - now)
    }

    /// Non-blocking admission; denied while the backoff window is active.
    pub fn allow(&self) -> bool {
        if self.backoff_remaining().is_some() {
            debug!("admission denied during upstream backoff window");
            return false;
        }
        self.inner.allow()
    }

    /// Block until admitted, sleeping out any backoff window first.
    ///
    /// Both the backoff sleep and the bucket wait abort promptly on
    /// cancellation.
    pub async fn wait<E>(&self, cancel: &CancellationToken) -> ResilienceResult<(), E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(remaining) = self.backoff_remaining() {
            debug!(?remaining, "sleeping out upstream backoff window");
            if !sleep_cancellable(cancel, remaining).await {
                return Err(ResilienceError::RetryCancelled);
            }
            self.clear_expired_backoff();
        }
        self.inner.wait(cancel).await
    }

    /// Clear the backoff window and restore the bucket to its configured
    /// capacity.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.backoff_until.write() {
            *guard = None;
        }
        self.inner.reset();
    }

    /// The wrapped token bucket.
    pub fn limiter(&self) -> &RateLimiter<C> {
        &self.inner
    }

    fn clear_expired_backoff(&self) {
        let now = self.clock.now();
        if let Ok(mut guard) = self.backoff_until.write() {
            if guard.is_some_and(|until| until <= now) {
                *guard = None;
            }
        }
    }
}
