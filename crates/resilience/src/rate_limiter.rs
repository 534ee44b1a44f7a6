//! Token-bucket admission control keyed by dependency name
//!
//! A bucket of capacity `burst` refills continuously at `rate_per_second`
//! tokens per second; each admitted call consumes one token. Fractional
//! rates are first-class, so "one request per six seconds" is representable.
//! Blocking admission (`wait`) and the retry executor's backoff sleep are
//! the only suspension points in the crate; both abort promptly on
//! cancellation.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::retry::sleep_cancellable;

/// Configuration for a token-bucket rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained admission rate in requests per second (sub-1 rates valid).
    pub rate_per_second: f64,
    /// Bucket capacity: the largest tolerated burst.
    pub burst: u32,
    /// Upper bound on blocking waits; `Duration::ZERO` means no timeout.
    pub wait_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rate_per_second: 10.0, burst: 5, wait_timeout: Duration::from_secs(5) }
    }
}

impl RateLimitConfig {
    /// Create a configuration builder.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.rate_per_second <= 0.0 || !self.rate_per_second.is_finite() {
            return Err(ConfigError::invalid("rate_per_second must be a finite value > 0"));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("burst must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`RateLimitConfig`].
#[derive(Debug, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimitConfig::default() }
    }

    pub fn rate_per_second(mut self, rate: f64) -> Self {
        self.config.rate_per_second = rate;
        self
    }

    pub fn burst(mut self, burst: u32) -> Self {
        self.config.burst = burst;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    pub fn no_wait_timeout(mut self) -> Self {
        self.config.wait_timeout = Duration::ZERO;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimitConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A granted future token, for callers that schedule work rather than block.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    delay: Duration,
}

impl Reservation {
    /// How long the holder must wait before acting on the reservation.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// True when the token was available immediately.
    pub fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }
}

/// Bucket bookkeeping guarded by the limiter's lock.
///
/// `tokens` goes negative when reservations borrow against future refill.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter.
///
/// Clones share the same bucket, so one limiter instance governs every
/// caller of its dependency.
pub struct RateLimiter<C: Clock = SystemClock> {
    config: RateLimitConfig,
    bucket: Arc<Mutex<BucketState>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            bucket: Arc::clone(&self.bucket),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

impl RateLimiter<SystemClock> {
    /// Create a limiter with the system clock.
    pub fn new(config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter with a custom clock (useful for testing).
    pub fn with_clock(config: RateLimitConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, Arc::new(clock)))
    }

    pub(crate) fn from_validated(config: RateLimitConfig, clock: Arc<C>) -> Self {
        let bucket =
            BucketState { tokens: f64::from(config.burst), last_refill: clock.now() };
        Self { config, bucket: Arc::new(Mutex::new(bucket)), clock }
    }

    /// The configuration this limiter was built from.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Non-blocking admission: consume one token if available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            debug!(available = bucket.tokens, "rate limit: no token available");
            false
        }
    }

    /// Non-blocking admission as a classified error.
    pub fn check<E>(&self) -> ResilienceResult<(), E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if self.allow() {
            Ok(())
        } else {
            Err(ResilienceError::RateLimited)
        }
    }

    /// Block until a token is granted, the wait timeout elapses, or the
    /// caller cancels.
    ///
    /// Returns `WaitTimeout` when the configured deadline cannot be met
    /// (fail-fast when the bucket could not possibly refill in time) and
    /// `RetryCancelled` when the cancellation token fires.
    pub async fn wait<E>(&self, cancel: &CancellationToken) -> ResilienceResult<(), E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let timeout = self.config.wait_timeout;
        let started = Instant::now();

        loop {
            let shortfall = {
                let mut bucket = self.lock_bucket();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.config.rate_per_second,
                    ))
                }
            };

            let Some(delay) = shortfall else {
                return Ok(());
            };

            if !timeout.is_zero() {
                let remaining = timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() || delay > remaining {
                    debug!(?timeout, ?delay, "rate limiter wait cannot meet deadline");
                    return Err(ResilienceError::WaitTimeout { timeout });
                }
            }

            if !sleep_cancellable(cancel, delay).await {
                return Err(ResilienceError::RetryCancelled);
            }
        }
    }

    /// Consume a future token grant without blocking.
    ///
    /// The bucket goes into deficit; the returned reservation says how long
    /// the holder must wait before acting on it. Reservations cannot be
    /// returned to the bucket.
    pub fn reserve(&self) -> Reservation {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);

        let delay = if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - bucket.tokens) / self.config.rate_per_second)
        };
        bucket.tokens -= 1.0;
        Reservation { delay }
    }

    /// Tokens currently available (may be negative under reservation debt).
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Restore the bucket to full capacity.
    pub fn reset(&self) {
        let mut bucket = self.lock_bucket();
        bucket.tokens = f64::from(self.config.burst);
        bucket.last_refill = self.clock.now();
    }

    /// Credit tokens for time elapsed since the last refill, capped at the
    /// burst capacity.
    fn refill(&self, bucket: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.config.rate_per_second)
                .min(f64::from(self.config.burst));
            bucket.last_refill = now;
        }
    }

    fn lock_bucket(&self) -> MutexGuard<'_, BucketState> {
        match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("rate limiter lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Per-entry bookkeeping for [`KeyedRateLimiter`].
struct KeyedEntry<C: Clock> {
    limiter: RateLimiter<C>,
    last_used: RwLock<Instant>,
}

impl<C: Clock> KeyedEntry<C> {
    fn touch(&self, now: Instant) {
        if let Ok(mut guard) = self.last_used.write() {
            *guard = now;
        }
    }

    fn idle_since(&self, now: Instant) -> Duration {
        let last = match self.last_used.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        now.duration_since(last)
    }
}

/// Map of limiters keyed by an arbitrary string (tier name, user id).
///
/// Entries are created lazily on first use; the dashmap entry API guarantees
/// at most one limiter per key under concurrent first use. Unlike the
/// never-evicting reference behavior, entries track last use and
/// [`evict_idle`](Self::evict_idle) bounds memory for high-cardinality key
/// spaces.
pub struct KeyedRateLimiter<C: Clock = SystemClock> {
    default_config: RateLimitConfig,
    limiters: DashMap<String, Arc<KeyedEntry<C>>>,
    clock: Arc<C>,
}

impl KeyedRateLimiter<SystemClock> {
    /// Create a keyed limiter whose entries default to `default_config`.
    pub fn new(default_config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_clock(default_config, SystemClock)
    }
}

impl<C: Clock> KeyedRateLimiter<C> {
    /// Create a keyed limiter with a custom clock (useful for testing).
    pub fn with_clock(default_config: RateLimitConfig, clock: C) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self { default_config, limiters: DashMap::new(), clock: Arc::new(clock) })
    }

    /// Register a tier with its own configuration, replacing any existing
    /// limiter for the key.
    pub fn add_tier(&self, key: impl Into<String>, config: RateLimitConfig) -> ConfigResult<()> {
        config.validate()?;
        let entry = Arc::new(KeyedEntry {
            limiter: RateLimiter::from_validated(config, Arc::clone(&self.clock)),
            last_used: RwLock::new(self.clock.now()),
        });
        self.limiters.insert(key.into(), entry);
        Ok(())
    }

    /// Non-blocking admission for one key.
    pub fn allow(&self, key: &str) -> bool {
        self.entry(key).limiter.allow()
    }

    /// Blocking admission for one key.
    pub async fn wait<E>(&self, key: &str, cancel: &CancellationToken) -> ResilienceResult<(), E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.entry(key).limiter.wait(cancel).await
    }

    /// Drop entries idle for at least `max_idle`; returns how many were
    /// evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let before = self.limiters.len();
        self.limiters.retain(|_, entry| entry.idle_since(now) < max_idle);
        before - self.limiters.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// True when no entries exist.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn entry(&self, key: &str) -> Arc<KeyedEntry<C>> {
        let now = self.clock.now();
        if let Some(entry) = self.limiters.get(key) {
            entry.touch(now);
            return Arc::clone(&entry);
        }

        let entry = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, "creating rate limiter for new key");
                Arc::new(KeyedEntry {
                    limiter: RateLimiter::from_validated(
                        self.default_config.clone(),
                        Arc::clone(&self.clock),
                    ),
                    last_used: RwLock::new(now),
                })
            })
            .clone();
        entry.touch(now);
        entry
    }
}
