//! Resilience layer for unreliable, rate-limited upstream services
//!
//! This crate protects calls to external dependencies (payment gateways,
//! banking aggregators, market-data feeds) with three cooperating
//! mechanisms:
//! - **Bounded retry** with exponential backoff and jitter
//! - **Circuit breaking** per dependency, so a failing upstream is left
//!   alone for a cooldown window instead of being hammered
//! - **Token-bucket rate limiting**, including an adaptive variant that
//!   honors upstream "slow down" signals
//!
//! The mechanisms compose through [`chain::ResilientCall`] in a fixed,
//! documented order (retry around rate limiting around the breaker) and
//! share per-dependency breaker/limiter instances through
//! [`registry::BreakerRegistry`] and [`registry::LimiterRegistry`].
//!
//! The crate wraps any operation shaped as an async call returning
//! `Result<T, E>`; it defines no network protocol of its own. Callers can
//! distinguish "the dependency is down" from "this call failed" through the
//! [`error::ResilienceError`] taxonomy.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod adaptive;
pub mod backoff;
pub mod chain;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod presets;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

// Re-export commonly used types for convenience
// ------------------------------
pub use adaptive::AdaptiveRateLimiter;
pub use backoff::{
    BackoffPolicy, BackoffPolicyBuilder, RetryAll, RetryClassifier, RetryIf, RetryKinds, RetryNone,
};
pub use chain::{CallFactory, CallOutcome, CallPolicy, ResilientCall};
pub use circuit_breaker::{
    BreakerCounts, BreakerStats, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitState, StateChangeHook,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
pub use rate_limiter::{
    KeyedRateLimiter, RateLimitConfig, RateLimitConfigBuilder, RateLimiter, Reservation,
};
pub use registry::{monitor_breakers, BreakerRegistry, LimiterRegistry};
pub use retry::{run, run_with_policy, RetryExecutor, RetryOutcome};
