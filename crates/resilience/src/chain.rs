//! Fixed-order resilient call chain
//!
//! A [`ResilientCall`] binds one dependency name to one backoff policy, one
//! shared rate limiter, and one shared circuit breaker, composed in a fixed,
//! documented order:
//!
//! ```text
//! retry ( rate_limit ( circuit_breaker ( remote call ) ) )
//! ```
//!
//! Rate limiting gates admission first, the breaker gates execution second,
//! and retry governs repetition of the whole inner sequence, so every repeat
//! re-enters the limiter and breaker gates. Structural rejections (open
//! circuit, probe cap, rate limit, wait timeout) are never retried; only
//! genuine operation failures consult the retry classifier.
//!
//! Each layer is optional per configuration, so a dependency can run with
//! any subset without the others changing.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::backoff::{BackoffPolicy, RetryAll, RetryClassifier};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::registry::{BreakerRegistry, LimiterRegistry};
use crate::retry::sleep_cancellable;

/// Which resilience layers a dependency's calls run under.
///
/// A `None` layer is simply absent from the chain.
#[derive(Debug, Clone, Default)]
pub struct CallPolicy {
    pub backoff: Option<BackoffPolicy>,
    pub rate_limit: Option<RateLimitConfig>,
    pub breaker: Option<CircuitBreakerConfig>,
}

impl CallPolicy {
    /// Policy with every layer enabled at its default configuration.
    pub fn standard() -> Self {
        Self {
            backoff: Some(BackoffPolicy::default()),
            rate_limit: Some(RateLimitConfig::default()),
            breaker: Some(CircuitBreakerConfig::default()),
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }
}

/// Outcome of one chain invocation including telemetry.
#[derive(Debug)]
pub struct CallOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: ResilienceResult<T, E>,
    /// Attempts actually performed (admission rejections included).
    pub attempts: u32,
    /// Accumulated backoff delay between attempts.
    pub total_delay: Duration,
    /// Wall-clock latency of the final attempt, gates included.
    pub last_attempt_latency: Duration,
}

impl<T, E> CallOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }
}

/// Factory producing per-dependency resilient calls that share breaker and
/// limiter instances through its registries.
pub struct CallFactory<C: Clock = SystemClock> {
    breakers: BreakerRegistry<C>,
    limiters: LimiterRegistry<C>,
}

impl CallFactory<SystemClock> {
    /// Create a factory with default registry configurations.
    pub fn new() -> Self {
        Self { breakers: BreakerRegistry::default(), limiters: LimiterRegistry::default() }
    }
}

impl Default for CallFactory<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> CallFactory<C> {
    /// Create a factory around existing registries.
    pub fn with_registries(breakers: BreakerRegistry<C>, limiters: LimiterRegistry<C>) -> Self {
        Self { breakers, limiters }
    }

    /// Build the resilient call for `name`, retrying on any error.
    ///
    /// Calling twice with the same name shares the underlying breaker and
    /// limiter; the per-layer configs apply only on first creation.
    pub fn create(&self, name: &str, policy: &CallPolicy) -> ConfigResult<ResilientCall<C>> {
        self.create_with_classifier(name, policy, RetryAll)
    }

    /// Build the resilient call for `name` with a custom retry classifier.
    pub fn create_with_classifier<P>(
        &self,
        name: &str,
        policy: &CallPolicy,
        classifier: P,
    ) -> ConfigResult<ResilientCall<C, P>> {
        if let Some(backoff) = &policy.backoff {
            backoff.validate()?;
        }
        let limiter = match &policy.rate_limit {
            Some(config) => Some(self.limiters.get_or_create(name, Some(config))?),
            None => None,
        };
        let breaker = match &policy.breaker {
            Some(config) => Some(self.breakers.get_or_create(name, Some(config))?),
            None => None,
        };

        Ok(ResilientCall {
            name: name.to_string(),
            backoff: policy.backoff.clone(),
            classifier,
            limiter,
            breaker,
        })
    }

    /// The breaker registry backing this factory.
    pub fn breakers(&self) -> &BreakerRegistry<C> {
        &self.breakers
    }

    /// The limiter registry backing this factory.
    pub fn limiters(&self) -> &LimiterRegistry<C> {
        &self.limiters
    }
}

/// A composed, reusable resilient operation bound to one dependency.
///
/// Created once per dependency at startup and safe for concurrent
/// invocation; the composition itself is never mutated after construction.
/// The breaker and limiter it wraps mutate their own internal counters.
pub struct ResilientCall<C: Clock = SystemClock, P = RetryAll> {
    name: String,
    backoff: Option<BackoffPolicy>,
    classifier: P,
    limiter: Option<Arc<RateLimiter<C>>>,
    breaker: Option<Arc<CircuitBreaker<C>>>,
}

impl<C: Clock, P> ResilientCall<C, P> {
    /// The dependency name this call is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared breaker guarding this dependency, if one is configured.
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker<C>>> {
        self.breaker.as_ref()
    }

    /// The shared limiter gating this dependency, if one is configured.
    pub fn limiter(&self) -> Option<&Arc<RateLimiter<C>>> {
        self.limiter.as_ref()
    }

    /// Invoke the wrapped operation through the full chain.
    #[instrument(skip(self, cancel, operation), fields(dependency = %self.name))]
    pub async fn run<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        P: RetryClassifier<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_outcome(cancel, operation).await.into_result()
    }

    /// Invoke the wrapped operation and return telemetry with the result.
    pub async fn run_with_outcome<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> CallOutcome<T, E>
    where
        P: RetryClassifier<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_retries = self.backoff.as_ref().map_or(0, |policy| policy.max_retries);
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        loop {
            attempts += 1;
            let started = Instant::now();
            let result = self.attempt(cancel, &operation).await;
            let last_attempt_latency = started.elapsed();

            let outcome =
                |result| CallOutcome { result, attempts, total_delay, last_attempt_latency };

            let source = match result {
                Ok(value) => {
                    debug!(dependency = %self.name, attempts, latency = ?last_attempt_latency,
                        "call succeeded");
                    return outcome(Ok(value));
                }
                // Structural rejections and cancellations are terminal; the
                // dependency was never reached, so repeating is pointless.
                Err(err) if err.is_rejection() || err.is_cancelled() => {
                    debug!(dependency = %self.name, error = %err, "call rejected");
                    return outcome(Err(err));
                }
                Err(ResilienceError::OperationFailed { source }) => source,
                Err(other) => return outcome(Err(other)),
            };

            if !self.classifier.is_retryable(&source) {
                debug!(dependency = %self.name, "error is not retryable");
                return outcome(Err(ResilienceError::OperationFailed { source }));
            }

            if attempts > max_retries {
                // Without a retry layer there is no budget to exhaust; the
                // failure passes through unwrapped by retry context.
                if self.backoff.is_none() {
                    return outcome(Err(ResilienceError::OperationFailed { source }));
                }
                warn!(dependency = %self.name, attempts, "max retries exceeded");
                return outcome(Err(ResilienceError::RetriesExhausted { attempts, source }));
            }

            let delay =
                self.backoff.as_ref().map_or(Duration::ZERO, |policy| policy.delay_for(attempts));
            warn!(dependency = %self.name, attempt = attempts, ?delay,
                "call failed, backing off");

            if !sleep_cancellable(cancel, delay).await {
                return outcome(Err(ResilienceError::RetryCancelled));
            }
            total_delay += delay;
        }
    }

    /// One pass through the inner gates: limiter, then breaker, then the
    /// remote call.
    async fn attempt<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: &F,
    ) -> ResilienceResult<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(limiter) = &self.limiter {
            limiter.wait(cancel).await?;
        }

        match &self.breaker {
            Some(breaker) => breaker.execute(operation).await,
            None => operation()
                .await
                .map_err(|source| ResilienceError::OperationFailed { source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::backoff::RetryNone;
    use crate::circuit_breaker::CircuitState;

    fn fast_backoff(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy::builder()
            .max_retries(max_retries)
            .initial_interval(Duration::from_millis(1))
            .max_interval(Duration::from_millis(2))
            .no_jitter()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_chain_success_passes_through() {
        let factory = CallFactory::new();
        let call = factory.create("upstream", &CallPolicy::standard()).unwrap();
        let cancel = CancellationToken::new();

        let result = call.run(&cancel, || async { Ok::<_, std::io::Error>(99) }).await;
        assert_eq!(result.unwrap(), 99);
    }

    /// Retry re-enters the inner gates and recovers from transient failures.
    #[tokio::test]
    async fn test_chain_retries_transient_failures() {
        let factory = CallFactory::new();
        let policy = CallPolicy::default()
            .with_backoff(fast_backoff(3))
            .with_breaker(CircuitBreakerConfig::default());
        let call = factory.create("flaky", &policy).unwrap();
        let cancel = CancellationToken::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_op = Arc::clone(&counter);
        let result = call
            .run(&cancel, move || {
                let c = Arc::clone(&counter_op);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(std::io::Error::other("transient"))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    /// Once the breaker opens, the rejection surfaces as CircuitOpen and is
    /// not retried.
    #[tokio::test]
    async fn test_chain_does_not_retry_open_circuit() {
        let factory = CallFactory::new();
        let policy = CallPolicy::default()
            .with_backoff(fast_backoff(5))
            .with_breaker(CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap());
        let call = factory.create("down", &policy).unwrap();
        let cancel = CancellationToken::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_op = Arc::clone(&counter);
        let result = call
            .run(&cancel, move || {
                let c = Arc::clone(&counter_op);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(std::io::Error::other("hard down"))
                }
            })
            .await;

        // First attempt fails and trips the breaker; the second attempt is
        // rejected at the gate and the rejection is terminal.
        assert!(matches!(result, Err(ResilienceError::CircuitOpen)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(call.breaker().unwrap().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_chain_exhausts_retries() {
        let factory = CallFactory::new();
        let policy = CallPolicy::default().with_backoff(fast_backoff(2));
        let call = factory.create("always-failing", &policy).unwrap();
        let cancel = CancellationToken::new();

        let outcome = call
            .run_with_outcome(&cancel, || async {
                Err::<(), _>(std::io::Error::other("persistent"))
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.total_delay >= Duration::from_millis(2));
        match outcome.result {
            Err(ResilienceError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "persistent");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chain_non_retryable_classifier() {
        let factory = CallFactory::new();
        let policy = CallPolicy::default().with_backoff(fast_backoff(5));
        let call = factory.create_with_classifier("strict", &policy, RetryNone).unwrap();
        let cancel = CancellationToken::new();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_op = Arc::clone(&counter);
        let result = call
            .run(&cancel, move || {
                let c = Arc::clone(&counter_op);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(std::io::Error::other("bad request"))
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// The limiter gates admission before the breaker ever sees the call.
    #[tokio::test]
    async fn test_chain_rate_limit_rejection_not_retried() {
        let factory = CallFactory::new();
        let policy = CallPolicy::default().with_backoff(fast_backoff(5)).with_rate_limit(
            RateLimitConfig::builder()
                .rate_per_second(0.1)
                .burst(1)
                .wait_timeout(Duration::from_millis(20))
                .build()
                .unwrap(),
        );
        let call = factory.create("throttled", &policy).unwrap();
        let cancel = CancellationToken::new();

        // Drain the bucket.
        assert!(call.limiter().unwrap().allow());

        let counter = Arc::new(AtomicU32::new(0));
        let counter_op = Arc::clone(&counter);
        let result = call
            .run(&cancel, move || {
                let c = Arc::clone(&counter_op);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(())
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::WaitTimeout { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    /// Two calls created for the same dependency share one breaker.
    #[tokio::test]
    async fn test_factory_shares_instances_per_name() {
        let factory = CallFactory::new();
        let policy = CallPolicy::default()
            .with_breaker(CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap());

        let first = factory.create("shared", &policy).unwrap();
        let second = factory.create("shared", &policy).unwrap();

        let _ = first
            .run(&CancellationToken::new(), || async {
                Err::<(), _>(std::io::Error::other("down"))
            })
            .await;

        assert_eq!(second.breaker().unwrap().state(), CircuitState::Open);
        assert_eq!(factory.breakers().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_without_layers_is_passthrough() {
        let factory = CallFactory::new();
        let call = factory.create("bare", &CallPolicy::default()).unwrap();
        let cancel = CancellationToken::new();

        assert!(call.breaker().is_none());
        assert!(call.limiter().is_none());

        let counter = Arc::new(AtomicU32::new(0));
        let counter_op = Arc::clone(&counter);
        let result = call
            .run(&cancel, move || {
                let c = Arc::clone(&counter_op);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(std::io::Error::other("once"))
                }
            })
            .await;

        // No retry layer configured: a single attempt whose failure passes
        // through without retry context.
        assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
