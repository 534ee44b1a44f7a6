//! Integration tests for the resilience layers
//!
//! Drives retry, circuit breaking, rate limiting, and the composed chain
//! through end-to-end failure scenarios with real time and concurrency.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use breakwater_resilience::{
    presets, BackoffPolicy, BreakerRegistry, CallFactory, CallPolicy, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, KeyedRateLimiter, MockClock, RateLimitConfig, RateLimiter,
    ResilienceError, ResilienceResult, RetryExecutor, RetryIf,
};
use tokio_util::sync::CancellationToken;

/// Custom error type for testing classification by category.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProviderError {
    Timeout,
    ServiceUnavailable,
    InvalidRequest,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Timeout => write!(f, "operation timeout"),
            ProviderError::ServiceUnavailable => write!(f, "service unavailable"),
            ProviderError::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Scenario from the retry contract: two retries at 10ms initial interval
/// and multiplier 2 make three attempts with ~10ms and ~20ms waits, then
/// report exhaustion wrapping the original error.
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_scenario_three_attempts_with_growing_waits() {
    let policy = BackoffPolicy::builder()
        .max_retries(2)
        .initial_interval(Duration::from_millis(10))
        .max_interval(Duration::from_secs(1))
        .multiplier(2.0)
        .no_jitter()
        .build()
        .expect("valid backoff policy");

    let executor = RetryExecutor::new(policy);
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_op = Arc::clone(&attempts);

    let started = Instant::now();
    let outcome = executor
        .execute_with_outcome(&cancel, || {
            let a = Arc::clone(&attempts_op);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::Timeout)
            }
        })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(attempts.load(Ordering::SeqCst), 3, "two retries mean three attempts");
    assert_eq!(outcome.attempts, 3);
    assert!(elapsed >= Duration::from_millis(30), "waits of 10ms and 20ms expected");

    match outcome.result {
        Err(ResilienceError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source, ProviderError::Timeout);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

/// Only configured error categories are retried; an invalid request fails
/// on the first attempt.
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_classifier_stops_on_non_retryable_category() {
    let policy = BackoffPolicy::builder()
        .max_retries(5)
        .initial_interval(Duration::from_millis(1))
        .no_jitter()
        .build()
        .expect("valid backoff policy");
    let classifier = RetryIf::new(|err: &ProviderError| {
        matches!(err, ProviderError::Timeout | ProviderError::ServiceUnavailable)
    });
    let executor = RetryExecutor::with_classifier(policy, classifier);
    let cancel = CancellationToken::new();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_op = Arc::clone(&attempts);
    let result = executor
        .execute(&cancel, || {
            let a = Arc::clone(&attempts_op);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::InvalidRequest)
            }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

/// Cancelling mid-backoff aborts the wait promptly with no extra attempts.
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_cancellation_mid_backoff() {
    let policy = BackoffPolicy::builder()
        .max_retries(3)
        .initial_interval(Duration::from_secs(30))
        .max_interval(Duration::from_secs(30))
        .no_jitter()
        .build()
        .expect("valid backoff policy");
    let executor = RetryExecutor::new(policy);
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        canceller.cancel();
    });

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_op = Arc::clone(&attempts);
    let started = Instant::now();
    let result = executor
        .execute(&cancel, || {
            let a = Arc::clone(&attempts_op);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::ServiceUnavailable)
            }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::RetryCancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(5), "cancellation must abort the wait");
}

/// Scenario from the breaker contract: threshold 3 opens the circuit, an
/// early call is rejected without reaching the dependency, and a call after
/// the cooldown is admitted as a half-open probe.
#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_open_then_half_open_probe() {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .success_threshold(1)
        .open_timeout(Duration::from_millis(50))
        .build()
        .expect("valid breaker config");
    let breaker = CircuitBreaker::new("market-data", config).expect("breaker should build");

    for _ in 0..3 {
        let result: ResilienceResult<(), _> = breaker
            .execute(|| async { Err(ProviderError::ServiceUnavailable) })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // 10ms later: still open, wrapped function must not run.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let invoked = Arc::new(AtomicU32::new(0));
    let invoked_op = Arc::clone(&invoked);
    let rejected: ResilienceResult<(), ProviderError> = breaker
        .execute(|| async move {
            invoked_op.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // After the cooldown the next call probes and closes the circuit.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let probe: ResilienceResult<&str, ProviderError> =
        breaker.execute(|| async { Ok("recovered") }).await;
    assert_eq!(probe.expect("probe should be admitted"), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// A failing probe sends the breaker straight back to open.
#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_failing_probe_reopens() {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1)
        .open_timeout(Duration::from_millis(20))
        .build()
        .expect("valid breaker config");
    let breaker = CircuitBreaker::new("payments", config).expect("breaker should build");

    let _: ResilienceResult<(), _> =
        breaker.execute(|| async { Err(ProviderError::Timeout) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let _: ResilienceResult<(), _> =
        breaker.execute(|| async { Err(ProviderError::Timeout) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);
}

/// State-change hooks observe the full recovery cycle in order.
#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_state_change_observability() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let transitions_hook = Arc::clone(&transitions);

    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1)
        .success_threshold(1)
        .open_timeout(Duration::from_millis(20))
        .on_state_change(move |name, from, to| {
            if let Ok(mut log) = transitions_hook.lock() {
                log.push(format!("{name}:{from}->{to}"));
            }
        })
        .build()
        .expect("valid breaker config");
    let breaker = CircuitBreaker::new("banking", config).expect("breaker should build");

    let _: ResilienceResult<(), _> =
        breaker.execute(|| async { Err(ProviderError::Timeout) }).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let _: ResilienceResult<(), ProviderError> = breaker.execute(|| async { Ok(()) }).await;

    let log = transitions.lock().expect("no poisoned lock in test");
    assert_eq!(
        *log,
        vec![
            "banking:CLOSED->OPEN".to_string(),
            "banking:OPEN->HALF_OPEN".to_string(),
            "banking:HALF_OPEN->CLOSED".to_string(),
        ]
    );
}

/// Limiter contract: 1 request/sec with burst 1 admits, denies, then admits
/// again after at least a second of refill.
#[tokio::test(flavor = "multi_thread")]
async fn test_limiter_one_per_second_burst_one() {
    let config = RateLimitConfig::builder()
        .rate_per_second(1.0)
        .burst(1)
        .build()
        .expect("valid limiter config");
    let limiter = RateLimiter::new(config).expect("limiter should build");

    assert!(limiter.allow(), "first call consumes the burst token");
    assert!(!limiter.allow(), "second immediate call must be denied");

    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert!(limiter.allow(), "token refills after one second");
}

/// Blocking admission wakes up as soon as the bucket refills.
#[tokio::test(flavor = "multi_thread")]
async fn test_limiter_wait_blocks_then_admits() {
    let config = RateLimitConfig::builder()
        .rate_per_second(10.0)
        .burst(1)
        .wait_timeout(Duration::from_secs(2))
        .build()
        .expect("valid limiter config");
    let limiter = RateLimiter::new(config).expect("limiter should build");
    let cancel = CancellationToken::new();

    assert!(limiter.allow());

    let started = Instant::now();
    limiter.wait::<ProviderError>(&cancel).await.expect("wait should succeed after refill");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "one token at 10 rps takes ~100ms");
}

/// Keyed limiters isolate tenants and evict idle entries.
#[tokio::test(flavor = "multi_thread")]
async fn test_keyed_limiter_per_user_isolation() {
    let clock = MockClock::new();
    let config = RateLimitConfig::builder()
        .rate_per_second(1.0)
        .burst(2)
        .build()
        .expect("valid limiter config");
    let keyed = KeyedRateLimiter::with_clock(config, clock.clone()).expect("keyed limiter");

    assert!(keyed.allow("user-a"));
    assert!(keyed.allow("user-a"));
    assert!(!keyed.allow("user-a"), "user-a exhausted its burst");
    assert!(keyed.allow("user-b"), "user-b has an independent bucket");

    clock.advance(Duration::from_secs(3600));
    keyed.allow("user-c");
    assert_eq!(keyed.evict_idle(Duration::from_secs(1800)), 2);
    assert_eq!(keyed.len(), 1);
}

/// Full chain: the preset-profiled call retries transient failures, shares
/// its breaker through the factory, and fails fast once the circuit opens.
#[tokio::test(flavor = "multi_thread")]
async fn test_chain_end_to_end_with_shared_breaker() {
    let factory = CallFactory::new();
    let policy = CallPolicy::default()
        .with_backoff(
            BackoffPolicy::builder()
                .max_retries(1)
                .initial_interval(Duration::from_millis(5))
                .no_jitter()
                .build()
                .expect("valid backoff policy"),
        )
        .with_breaker(
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .open_timeout(Duration::from_secs(60))
                .build()
                .expect("valid breaker config"),
        );

    let call = factory.create("gateway", &policy).expect("chain should build");
    let cancel = CancellationToken::new();

    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_op = Arc::clone(&invocations);
    let result = call
        .run(&cancel, move || {
            let i = Arc::clone(&invocations_op);
            async move {
                i.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::ServiceUnavailable)
            }
        })
        .await;

    // Two invocations trip the breaker at threshold 2.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert!(matches!(result, Err(ResilienceError::RetriesExhausted { attempts: 2, .. })));
    assert_eq!(call.breaker().expect("breaker configured").state(), CircuitState::Open);

    // A second call through the same factory shares the open breaker and is
    // rejected before the operation runs.
    let second = factory.create("gateway", &policy).expect("chain should build");
    let untouched = Arc::new(AtomicU32::new(0));
    let untouched_op = Arc::clone(&untouched);
    let rejected = second
        .run(&cancel, move || {
            let u = Arc::clone(&untouched_op);
            async move {
                u.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(())
            }
        })
        .await;

    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen)));
    assert_eq!(untouched.load(Ordering::SeqCst), 0);
}

/// Concurrent callers share one chain without corrupting breaker counts.
#[tokio::test(flavor = "multi_thread")]
async fn test_chain_concurrent_invocations() {
    let factory = CallFactory::new();
    let policy = CallPolicy::default().with_breaker(CircuitBreakerConfig::default());
    let call = Arc::new(factory.create("busy", &policy).expect("chain should build"));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let call = Arc::clone(&call);
        handles.push(tokio::spawn(async move {
            call.run(&CancellationToken::new(), || async { Ok::<_, ProviderError>(1u32) }).await
        }));
    }

    let mut total = 0u32;
    for handle in handles {
        total += handle.await.expect("task join").expect("call should succeed");
    }
    assert_eq!(total, 32);

    let counts = call.breaker().expect("breaker configured").counts();
    assert_eq!(counts.requests, 32);
    assert_eq!(counts.successes, 32);
}

/// Preset profiles wire straight into the factory.
#[tokio::test(flavor = "multi_thread")]
async fn test_presets_compose_with_factory() {
    let factory = CallFactory::new();
    let profile = presets::payment_gateway();
    let call = factory.create("card-processor", &profile.call_policy()).expect("chain builds");
    let cancel = CancellationToken::new();

    let result = call.run(&cancel, || async { Ok::<_, ProviderError>("charged") }).await;
    assert_eq!(result.expect("call should succeed"), "charged");

    let stats = factory.breakers().stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "card-processor");
    assert_eq!(stats[0].state, CircuitState::Closed);
}

/// Registries hand every concurrent caller the same instance per name.
#[tokio::test(flavor = "multi_thread")]
async fn test_registry_concurrent_creation_race() {
    let registry = Arc::new(BreakerRegistry::default());

    let mut handles = Vec::new();
    for _ in 0..24 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry.get_or_create("contended", None).expect("creation should succeed")
        }));
    }

    let mut breakers = Vec::new();
    for handle in handles {
        breakers.push(handle.await.expect("task join"));
    }
    assert!(breakers.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(registry.len(), 1);
}
