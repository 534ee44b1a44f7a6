//! Process-wide registries mapping dependency names to shared instances
//!
//! All callers of one dependency must share its breaker and limiter, so each
//! registry guarantees at most one instance per name: lookups go through the
//! map's entry locking, which makes lazy first-use construction race-free.
//! Registries are explicit objects injected into call sites, not ambient
//! globals.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigResult;
use crate::rate_limiter::{RateLimitConfig, RateLimiter};

/// Registry of circuit breakers keyed by dependency name.
pub struct BreakerRegistry<C: Clock = SystemClock> {
    breakers: DashMap<String, Arc<CircuitBreaker<C>>>,
    default_config: CircuitBreakerConfig,
    clock: Arc<C>,
}

impl BreakerRegistry<SystemClock> {
    /// Create a registry whose breakers default to `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(default_config, SystemClock)
    }
}

impl Default for BreakerRegistry<SystemClock> {
    fn default() -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: CircuitBreakerConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<C: Clock> BreakerRegistry<C> {
    /// Create a registry with a custom clock (useful for testing).
    pub fn with_clock(default_config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self { breakers: DashMap::new(), default_config, clock: Arc::new(clock) })
    }

    /// Look up an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker<C>>> {
        self.breakers.get(name).map(|entry| Arc::clone(&entry))
    }

    /// Get the breaker for `name`, creating it on first use.
    ///
    /// `config` applies only if this call creates the instance; later
    /// callers share whatever was registered first.
    pub fn get_or_create(
        &self,
        name: &str,
        config: Option<&CircuitBreakerConfig>,
    ) -> ConfigResult<Arc<CircuitBreaker<C>>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let config = config.cloned().unwrap_or_else(|| self.default_config.clone());
        config.validate()?;

        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "creating circuit breaker");
                Arc::new(CircuitBreaker::from_validated(
                    name.to_string(),
                    config,
                    Arc::clone(&self.clock),
                ))
            })
            .clone();
        Ok(breaker)
    }

    /// Names of every registered breaker.
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every breaker's state and counts.
    pub fn stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|entry| entry.value().stats()).collect()
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no breakers are registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Registry of rate limiters keyed by dependency name.
pub struct LimiterRegistry<C: Clock = SystemClock> {
    limiters: DashMap<String, Arc<RateLimiter<C>>>,
    default_config: RateLimitConfig,
    clock: Arc<C>,
}

impl LimiterRegistry<SystemClock> {
    /// Create a registry whose limiters default to `default_config`.
    pub fn new(default_config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_clock(default_config, SystemClock)
    }
}

impl Default for LimiterRegistry<SystemClock> {
    fn default() -> Self {
        Self {
            limiters: DashMap::new(),
            default_config: RateLimitConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<C: Clock> LimiterRegistry<C> {
    /// Create a registry with a custom clock (useful for testing).
    pub fn with_clock(default_config: RateLimitConfig, clock: C) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self { limiters: DashMap::new(), default_config, clock: Arc::new(clock) })
    }

    /// Look up an existing limiter.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter<C>>> {
        self.limiters.get(name).map(|entry| Arc::clone(&entry))
    }

    /// Get the limiter for `name`, creating it on first use.
    ///
    /// `config` applies only if this call creates the instance.
    pub fn get_or_create(
        &self,
        name: &str,
        config: Option<&RateLimitConfig>,
    ) -> ConfigResult<Arc<RateLimiter<C>>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let config = config.cloned().unwrap_or_else(|| self.default_config.clone());
        config.validate()?;

        let limiter = self
            .limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name, "creating rate limiter");
                Arc::new(RateLimiter::from_validated(config, Arc::clone(&self.clock)))
            })
            .clone();
        Ok(limiter)
    }

    /// Names of every registered limiter.
    pub fn names(&self) -> Vec<String> {
        self.limiters.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// True when no limiters are registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// Periodically log every breaker's state until cancelled.
///
/// Operational visibility for long-running services; pairs with the
/// state-change hook for transition-level alerting.
pub async fn monitor_breakers<C: Clock>(
    registry: Arc<BreakerRegistry<C>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for stats in registry.stats() {
                    info!(
                        breaker = %stats.name,
                        state = %stats.state,
                        requests = stats.counts.requests,
                        successes = stats.counts.successes,
                        failures = stats.counts.failures,
                        "circuit breaker status"
                    );
                }
            }
        }
    }
}
