//! Circuit breaker pattern implementation.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{SdkError, SdkResult};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests are allowed.
    Closed,
    /// Circuit is open - requests fail fast.
    Open,
    /// Circuit is half-open - a single trial request is allowed.
    HalfOpen,
}

impl CircuitState {
    /// Returns the lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` needed to open the circuit.
    pub failure_threshold: u32,
    /// Rolling window for counting failures.
    pub failure_window: Duration,
    /// Time after the last failure before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the failure window.
    pub fn failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Sets the reset timeout.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SdkResult<()> {
        if self.failure_threshold == 0 {
            return Err(SdkError::configuration(
                "Circuit breaker failure_threshold must be at least 1",
            ));
        }
        if self.failure_window.is_zero() {
            return Err(SdkError::configuration(
                "Circuit breaker failure_window must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Hook for circuit breaker state changes.
pub trait CircuitBreakerHook: Send + Sync {
    /// Called after the circuit state changes.
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState);
}

/// Predicate deciding whether an error counts toward the failure threshold.
pub type FailurePredicate = Arc<dyn Fn(&SdkError) -> bool + Send + Sync>;

/// Circuit breaker statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Qualifying failures inside the current window.
    pub recent_failures: usize,
    /// Time since the last qualifying failure.
    pub since_last_failure: Option<Duration>,
    /// Calls submitted to `execute`.
    pub total_calls: u64,
    /// Calls rejected without running.
    pub total_rejections: u64,
}

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_failure_time: Option<Instant>,
    probe_in_flight: bool,
}

enum Admission {
    Normal,
    Probe,
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Frees the half-open trial slot if the trial future is dropped before it completes.
struct ProbeSlot<'a> {
    state: &'a Mutex<BreakerState>,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().probe_in_flight = false;
        }
    }
}

/// Circuit breaker for isolating a failing dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    should_fail: FailurePredicate,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                last_failure_time: None,
                probe_in_flight: false,
            }),
            should_fail: Arc::new(SdkError::counts_as_breaker_failure),
            hook: None,
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Replaces the predicate deciding which errors count as failures.
    ///
    /// Errors rejected by the predicate still propagate to the caller.
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&SdkError) -> bool + Send + Sync + 'static,
    {
        self.should_fail = Arc::new(predicate);
        self
    }

    /// Sets a state change hook.
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state.
    ///
    /// The open to half-open transition is evaluated lazily here and on each
    /// call attempt.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut guard = self.state.lock();
            let transition = self.maybe_half_open(&mut guard, Instant::now());
            (guard.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Returns true if the circuit is open.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Runs `operation` through the breaker.
    ///
    /// While open, fails with [`SdkError::CircuitOpen`] without invoking
    /// `operation`. While half-open, only one caller at a time runs the trial.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> SdkResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SdkResult<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let admission = self.acquire()?;
        let mut slot = ProbeSlot {
            state: &self.state,
            armed: matches!(admission, Admission::Probe),
        };

        let result = operation().await;

        let transition = {
            let mut guard = self.state.lock();
            if slot.armed {
                guard.probe_in_flight = false;
                slot.armed = false;
            }
            // Only the trial call may settle a half-open breaker; calls admitted
            // before the breaker opened count only while it is still closed.
            let current = match (&admission, guard.state) {
                (_, CircuitState::Closed) | (Admission::Probe, CircuitState::HalfOpen) => true,
                (Admission::Normal, _) | (Admission::Probe, CircuitState::Open) => false,
            };
            match &result {
                _ if !current => {
                    debug!(state = %guard.state, "Ignoring result of a call admitted before the last transition");
                    None
                }
                Ok(_) => self.on_success(&mut guard),
                Err(error) if (self.should_fail)(error) => self.on_failure(&mut guard),
                Err(error) => {
                    debug!(error = %error, "Error excluded from circuit breaker accounting");
                    None
                }
            }
        };
        self.notify(transition);

        result
    }

    /// Returns statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let (state, recent_failures, since_last_failure, transition) = {
            let mut guard = self.state.lock();
            let transition = self.maybe_half_open(&mut guard, now);
            self.prune(&mut guard, now);
            (
                guard.state,
                guard.failures.len(),
                guard
                    .last_failure_time
                    .map(|t| now.saturating_duration_since(t)),
                transition,
            )
        };
        self.notify(transition);

        CircuitBreakerStats {
            state,
            recent_failures,
            since_last_failure,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Forces the breaker back to closed and clears the failure history.
    pub fn reset(&self) {
        let transition = {
            let mut guard = self.state.lock();
            guard.failures.clear();
            guard.last_failure_time = None;
            guard.probe_in_flight = false;
            Self::transition(&mut guard, CircuitState::Closed)
        };
        self.notify(transition);
    }

    fn acquire(&self) -> SdkResult<Admission> {
        let now = Instant::now();
        let (admission, transition) = {
            let mut guard = self.state.lock();
            let transition = self.maybe_half_open(&mut guard, now);
            let admission = match guard.state {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::HalfOpen if !guard.probe_in_flight => {
                    guard.probe_in_flight = true;
                    debug!("Circuit breaker admitting trial call");
                    Ok(Admission::Probe)
                }
                CircuitState::HalfOpen => Err(None),
                CircuitState::Open => Err(guard
                    .last_failure_time
                    .map(|t| (t + self.config.reset_timeout).saturating_duration_since(now))),
            };
            (admission, transition)
        };
        self.notify(transition);

        admission.map_err(|retry_after| {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            SdkError::CircuitOpen { retry_after }
        })
    }

    fn on_success(&self, guard: &mut BreakerState) -> Transition {
        match guard.state {
            CircuitState::HalfOpen => {
                guard.failures.clear();
                guard.last_failure_time = None;
                Self::transition(guard, CircuitState::Closed)
            }
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    fn on_failure(&self, guard: &mut BreakerState) -> Transition {
        let now = Instant::now();
        guard.last_failure_time = Some(now);

        match guard.state {
            CircuitState::Closed => {
                guard.failures.push_back(now);
                self.prune(guard, now);
                if guard.failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        failures = guard.failures.len(),
                        "Circuit breaker failure threshold reached"
                    );
                    Self::transition(guard, CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Self::transition(guard, CircuitState::Open),
            CircuitState::Open => None,
        }
    }

    fn prune(&self, guard: &mut BreakerState, now: Instant) {
        while let Some(&oldest) = guard.failures.front() {
            if now.saturating_duration_since(oldest) > self.config.failure_window {
                guard.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_half_open(&self, guard: &mut BreakerState, now: Instant) -> Transition {
        if guard.state != CircuitState::Open {
            return None;
        }
        let eligible = guard
            .last_failure_time
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.reset_timeout);
        if eligible {
            Self::transition(guard, CircuitState::HalfOpen)
        } else {
            None
        }
    }

    fn transition(guard: &mut BreakerState, new_state: CircuitState) -> Transition {
        let old_state = guard.state;
        if old_state == new_state {
            return None;
        }
        guard.state = new_state;
        if new_state != CircuitState::HalfOpen {
            guard.probe_in_flight = false;
        }
        info!(from = %old_state, to = %new_state, "Circuit breaker state change");
        Some((old_state, new_state))
    }

    fn notify(&self, transition: Transition) {
        if let (Some(hook), Some((old_state, new_state))) = (&self.hook, transition) {
            hook.on_state_change(old_state, new_state);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state.lock().state)
            .finish()
    }
}
