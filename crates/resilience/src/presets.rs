//! Ready-made profiles for the upstream categories this layer fronts
//!
//! Numbers reflect the published limits and failure characteristics of the
//! respective provider classes: payment gateways tolerate aggressive rates
//! but deserve short retry intervals, banking aggregators want conservative
//! traffic, and free-tier market-data feeds are limited to a handful of
//! requests per minute.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::chain::CallPolicy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiter::RateLimitConfig;

/// Bundled per-dependency tuning: backoff, rate limit, and breaker.
#[derive(Debug, Clone)]
pub struct DependencyProfile {
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitConfig,
    pub breaker: CircuitBreakerConfig,
}

impl DependencyProfile {
    /// Convert into a [`CallPolicy`] with every layer enabled.
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            backoff: Some(self.backoff.clone()),
            rate_limit: Some(self.rate_limit.clone()),
            breaker: Some(self.breaker.clone()),
        }
    }
}

/// Profile for payment gateways (card processors, payout APIs).
pub fn payment_gateway() -> DependencyProfile {
    DependencyProfile {
        backoff: BackoffPolicy {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        },
        rate_limit: RateLimitConfig {
            rate_per_second: 100.0,
            burst: 25,
            wait_timeout: Duration::from_secs(5),
        },
        breaker: CircuitBreakerConfig::default(),
    }
}

/// Profile for banking aggregators (account and transaction APIs).
pub fn banking_aggregator() -> DependencyProfile {
    DependencyProfile {
        backoff: BackoffPolicy {
            max_retries: 2,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            multiplier: 1.5,
            jitter: true,
        },
        rate_limit: RateLimitConfig {
            rate_per_second: 10.0,
            burst: 5,
            wait_timeout: Duration::from_secs(10),
        },
        breaker: CircuitBreakerConfig::default(),
    }
}

/// Profile for market-data feeds on free-tier quotas.
pub fn market_data() -> DependencyProfile {
    DependencyProfile {
        backoff: BackoffPolicy::default(),
        // Ten requests per minute.
        rate_limit: RateLimitConfig {
            rate_per_second: 10.0 / 60.0,
            burst: 5,
            wait_timeout: Duration::from_secs(15),
        },
        breaker: CircuitBreakerConfig::default(),
    }
}
