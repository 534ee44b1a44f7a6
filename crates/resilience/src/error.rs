//! Error taxonomy shared by every resilience layer
//!
//! Callers need to tell "the dependency is down" apart from "this call
//! failed", so every structural rejection gets its own variant instead of
//! being folded into the underlying error. The enum is generic over the
//! wrapped operation's error type `E` and preserves the original failure as
//! a source where one exists.

use std::time::Duration;

use thiserror::Error;

/// Simple configuration error for builder validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid { message: message.into() }
    }
}

/// Configuration result type.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by the resilience layers.
///
/// Nothing here is fatal to the process; every variant is a per-call
/// condition the caller can recover from (retry elsewhere, surface to the
/// user, queue for later).
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open; the operation was never invoked.
    #[error("circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// Half-open probe capacity is exhausted; the operation was never
    /// invoked.
    #[error("too many requests while circuit is half-open")]
    TooManyRequests,

    /// Non-blocking rate-limit admission was denied.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The rate limiter's blocking wait exceeded its deadline.
    #[error("rate limiter wait timed out after {timeout:?}")]
    WaitTimeout { timeout: Duration },

    /// The retry budget was spent; wraps the last failure.
    #[error("max retries exceeded after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// Caller cancellation fired during a backoff or limiter wait.
    #[error("retry cancelled by caller")]
    RetryCancelled,

    /// The wrapped operation failed and was not retried further.
    #[error("operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },

    /// Configuration error surfaced at execution time.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// True when admission was denied before the wrapped operation ran.
    ///
    /// These are the conditions fallbacks key off: the dependency was never
    /// actually called, so the caller may try an alternative without
    /// double-spending side effects.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::TooManyRequests
                | ResilienceError::RateLimited
                | ResilienceError::WaitTimeout { .. }
        )
    }

    /// True when the breaker rejected the call (open or probe cap reached).
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen | ResilienceError::TooManyRequests)
    }

    /// True when a caller-supplied cancellation aborted a wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::RetryCancelled)
    }

    /// Extract the underlying operation error, if this variant carries one.
    pub fn into_source(self) -> Option<E> {
        match self {
            ResilienceError::RetriesExhausted { source, .. }
            | ResilienceError::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

impl<E> From<ConfigError> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: ConfigError) -> Self {
        let ConfigError::Invalid { message } = err;
        ResilienceError::InvalidConfiguration { message }
    }
}

/// Result type for resilience operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;
