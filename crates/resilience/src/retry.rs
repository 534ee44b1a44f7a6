//! Retry executor: bounded attempts with cancellable backoff waits
//!
//! Exactly one attempt runs before the first wait; a policy with
//! `max_retries = n` performs at most `n + 1` invocations. The inter-attempt
//! sleep races the caller's cancellation token, so a fired deadline aborts
//! the wait immediately instead of being swallowed.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::backoff::{BackoffPolicy, RetryAll, RetryClassifier};
use crate::error::{ResilienceError, ResilienceResult};

/// Outcome of a retry execution including summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: ResilienceResult<T, E>,
    /// Invocations actually performed.
    pub attempts: u32,
    /// Accumulated backoff delay between attempts.
    pub total_delay: Duration,
    /// Wall-clock latency of the final attempt.
    pub last_attempt_latency: Duration,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }
}

/// Executes operations under a [`BackoffPolicy`], consulting a
/// [`RetryClassifier`] before each repeat.
pub struct RetryExecutor<P = RetryAll> {
    policy: BackoffPolicy,
    classifier: P,
}

impl RetryExecutor<RetryAll> {
    /// Create an executor that retries on any error.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_classifier(policy, RetryAll)
    }
}

impl<P> RetryExecutor<P> {
    /// Create an executor with a custom retry classifier.
    pub fn with_classifier(policy: BackoffPolicy, classifier: P) -> Self {
        Self { policy, classifier }
    }

    /// The backoff policy this executor runs under.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Execute an operation with retry logic.
    #[instrument(skip(self, cancel, operation), fields(max_retries = self.policy.max_retries))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        P: RetryClassifier<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(cancel, operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        P: RetryClassifier<E>,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        loop {
            attempts += 1;
            let started = Instant::now();
            let result = operation().await;
            let last_attempt_latency = started.elapsed();

            let outcome = |result| RetryOutcome { result, attempts, total_delay, last_attempt_latency };

            match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retries");
                    }
                    return outcome(Ok(value));
                }
                Err(error) => {
                    if !self.classifier.is_retryable(&error) {
                        debug!("operation failed with non-retryable error");
                        return outcome(Err(ResilienceError::OperationFailed { source: error }));
                    }

                    if attempts > self.policy.max_retries {
                        warn!(attempts, "max retries exceeded");
                        return outcome(Err(ResilienceError::RetriesExhausted {
                            attempts,
                            source: error,
                        }));
                    }

                    let delay = self.policy.delay_for(attempts);
                    warn!(attempt = attempts, ?delay, "operation failed, backing off");

                    if !sleep_cancellable(cancel, delay).await {
                        debug!("cancellation fired during backoff wait");
                        return outcome(Err(ResilienceError::RetryCancelled));
                    }
                    total_delay += delay;
                }
            }
        }
    }
}

/// Sleep for `delay`, returning `false` immediately if cancellation fires
/// first.
pub(crate) async fn sleep_cancellable(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Convenience function: retry with an explicit policy and classifier.
pub async fn run_with_policy<F, Fut, T, E, P>(
    cancel: &CancellationToken,
    policy: BackoffPolicy,
    classifier: P,
    operation: F,
) -> ResilienceResult<T, E>
where
    P: RetryClassifier<E>,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryExecutor::with_classifier(policy, classifier).execute(cancel, operation).await
}

/// Convenience function: retry any error under the default policy.
pub async fn run<F, Fut, T, E>(cancel: &CancellationToken, operation: F) -> ResilienceResult<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run_with_policy(cancel, BackoffPolicy::default(), RetryAll, operation).await
}
