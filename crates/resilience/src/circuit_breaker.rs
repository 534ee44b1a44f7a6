//! Per-dependency circuit breaker
//!
//! A finite-state machine that stops calling a failing dependency for a
//! cooldown window. All state for one instance lives behind a single mutex;
//! decisions are O(1) and never suspend. Instances for different dependency
//! names share nothing, so one overloaded upstream cannot starve another's
//! breaker.
//!
//! # State transitions
//! ```text
//! Closed → Open:      consecutive_failures >= failure_threshold
//! Open → HalfOpen:    open_timeout elapsed, on the next incoming call
//! HalfOpen → Closed:  consecutive_successes >= success_threshold
//! HalfOpen → Open:    any probe failure
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through; results update the rolling counts.
    Closed,
    /// Requests are rejected without invoking the dependency.
    Open,
    /// A limited number of probes test whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Rolling request counts for one breaker.
///
/// Reset on every state transition and on each statistical-window roll while
/// the breaker is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_successes: u64,
    pub consecutive_failures: u64,
}

impl BreakerCounts {
    fn record_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = BreakerCounts::default();
    }
}

/// Callback invoked on every state transition with
/// `(name, from_state, to_state)`.
///
/// Fires synchronously but outside the breaker's lock, so it cannot block
/// the triggering request's critical section. Listeners doing slow work
/// should hand it off to a queue or task of their own.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Configuration for circuit breaker behavior.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures needed to trip the circuit open.
    pub failure_threshold: u64,
    /// Consecutive half-open successes needed to close the circuit.
    pub success_threshold: u64,
    /// Cooldown spent open before probing resumes.
    pub open_timeout: Duration,
    /// Rolling window after which closed-state counts reset.
    pub stat_window: Duration,
    /// Maximum concurrent probes admitted while half-open.
    pub half_open_max_calls: u64,
    /// Observer notified of every state transition.
    pub on_state_change: Option<StateChangeHook>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .field("stat_window", &self.stat_window)
            .field("half_open_max_calls", &self.half_open_max_calls)
            .field("on_state_change", &self.on_state_change.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            stat_window: Duration::from_secs(60),
            half_open_max_calls: 3,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::invalid("open_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn stat_window(mut self, window: Duration) -> Self {
        self.config.stat_window = window;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.config.on_state_change = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Snapshot of one breaker's identity and counters.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub counts: BreakerCounts,
}

/// Mutable state guarded by the breaker's single lock.
///
/// The generation counter discards outcomes recorded by calls that were
/// admitted before a transition or window roll, so stale probes cannot
/// corrupt fresh counts.
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    counts: BreakerCounts,
    generation: u64,
    changed_at: Instant,
    window_started: Instant,
    half_open_inflight: u64,
}

/// Ticket for one admitted call, consumed when its outcome is recorded.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    half_open: bool,
}

/// Circuit breaker keyed to a single dependency name.
///
/// Clones share the same underlying state, so a breaker can be handed to any
/// number of concurrent callers.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    core: Arc<Mutex<BreakerCore>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            core: Arc::clone(&self.core),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker with the given configuration using the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_validated(name.into(), CircuitBreakerConfig::default(), Arc::new(SystemClock))
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, Arc::new(clock)))
    }

    pub(crate) fn from_validated(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<C>,
    ) -> Self {
        let now = clock.now();
        Self {
            name,
            config,
            core: Arc::new(Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                counts: BreakerCounts::default(),
                generation: 0,
                changed_at: now,
                window_started: now,
                half_open_inflight: 0,
            })),
            clock,
        }
    }

    /// The dependency name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state of the breaker.
    pub fn state(&self) -> CircuitState {
        self.lock_core().state
    }

    /// Snapshot of the rolling counts.
    pub fn counts(&self) -> BreakerCounts {
        self.lock_core().counts
    }

    /// Snapshot of identity, state, and counts for monitoring.
    pub fn stats(&self) -> BreakerStats {
        let core = self.lock_core();
        BreakerStats { name: self.name.clone(), state: core.state, counts: core.counts }
    }

    /// Cheap availability check without driving any transition.
    pub fn is_available(&self) -> bool {
        self.lock_core().state != CircuitState::Open
    }

    /// Execute an async operation under breaker protection.
    ///
    /// Admission is decided before the operation runs; an open circuit or a
    /// full probe window rejects the call without invoking it.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let admission = self.admit()?;

        match operation().await {
            Ok(result) => {
                self.settle(admission, true);
                debug!(breaker = %self.name, "operation succeeded");
                Ok(result)
            }
            Err(error) => {
                self.settle(admission, false);
                warn!(breaker = %self.name, error = %error, "operation failed");
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute a synchronous operation under breaker protection.
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let admission = self.admit()?;

        match operation() {
            Ok(result) => {
                self.settle(admission, true);
                Ok(result)
            }
            Err(error) => {
                self.settle(admission, false);
                warn!(breaker = %self.name, error = %error, "operation failed");
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute with a fallback that runs only on structural rejection.
    ///
    /// The fallback is consulted when the breaker refused admission (open
    /// circuit or probe cap), never for ordinary operation failures; those
    /// still count toward the failure tally and propagate to the caller.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.execute(operation).await {
            Err(err) if err.is_circuit_rejection() => {
                debug!(breaker = %self.name, "falling back after circuit rejection");
                fallback().await.map_err(|source| ResilienceError::OperationFailed { source })
            }
            other => other,
        }
    }

    /// Force the breaker back to closed with fresh counters.
    ///
    /// Operational escape hatch, not a normal code path.
    pub fn reset(&self) {
        let transition = {
            let mut core = self.lock_core();
            let now = self.clock.now();
            let from = core.state;
            core.roll_generation(CircuitState::Closed, now);
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        info!(breaker = %self.name, "circuit breaker manually reset");
        self.notify(transition);
    }

    /// Decide admission for one call, lazily driving Open → HalfOpen.
    fn admit<E>(&self) -> Result<Admission, ResilienceError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let now = self.clock.now();
        let (decision, transition) = {
            let mut core = self.lock_core();
            core.maybe_roll_window(self.config.stat_window, now);

            match core.state {
                CircuitState::Closed => {
                    core.counts.requests += 1;
                    (Ok(Admission { generation: core.generation, half_open: false }), None)
                }
                CircuitState::Open => {
                    if now.duration_since(core.changed_at) >= self.config.open_timeout {
                        let from = core.state;
                        core.roll_generation(CircuitState::HalfOpen, now);
                        core.half_open_inflight = 1;
                        core.counts.requests += 1;
                        (
                            Ok(Admission { generation: core.generation, half_open: true }),
                            Some((from, CircuitState::HalfOpen)),
                        )
                    } else {
                        (Err(ResilienceError::CircuitOpen), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if core.half_open_inflight >= self.config.half_open_max_calls {
                        (Err(ResilienceError::TooManyRequests), None)
                    } else {
                        core.half_open_inflight += 1;
                        core.counts.requests += 1;
                        (Ok(Admission { generation: core.generation, half_open: true }), None)
                    }
                }
            }
        };

        self.notify(transition);
        if let Err(err) = &decision {
            debug!(breaker = %self.name, error = %err, "rejecting call");
        }
        decision
    }

    /// Record one admitted call's outcome, driving any resulting transition.
    fn settle(&self, admission: Admission, success: bool) {
        let now = self.clock.now();
        let transition = {
            let mut core = self.lock_core();
            if admission.generation != core.generation {
                // Stale outcome from before a transition or window roll.
                return;
            }
            if admission.half_open {
                core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
            }

            if success {
                core.counts.record_success();
                match core.state {
                    CircuitState::HalfOpen
                        if core.counts.consecutive_successes >= self.config.success_threshold =>
                    {
                        core.roll_generation(CircuitState::Closed, now);
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    }
                    _ => None,
                }
            } else {
                core.counts.record_failure();
                match core.state {
                    CircuitState::Closed
                        if core.counts.consecutive_failures >= self.config.failure_threshold =>
                    {
                        core.roll_generation(CircuitState::Open, now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    }
                    CircuitState::HalfOpen => {
                        core.roll_generation(CircuitState::Open, now);
                        Some((CircuitState::HalfOpen, CircuitState::Open))
                    }
                    _ => None,
                }
            }
        };

        self.notify(transition);
    }

    /// Fire the state-change hook outside the lock.
    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, %from, %to, "circuit breaker state change");
            if let Some(hook) = &self.config.on_state_change {
                hook(&self.name, from, to);
            }
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, BreakerCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(breaker = %self.name, "circuit breaker lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl BreakerCore {
    /// Enter a new state (or re-enter the current one) with fresh counters.
    fn roll_generation(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.counts.clear();
        self.generation += 1;
        self.changed_at = now;
        self.window_started = now;
        self.half_open_inflight = 0;
    }

    /// Reset closed-state counts once the statistical window elapses, so
    /// stale history cannot trip the circuit.
    fn maybe_roll_window(&mut self, window: Duration, now: Instant) {
        if self.state == CircuitState::Closed
            && !window.is_zero()
            && now.duration_since(self.window_started) >= window
        {
            self.counts.clear();
            self.generation += 1;
            self.window_started = now;
        }
    }
}
