//! Retry logic with exponential backoff and jitter.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{SdkError, SdkResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Jitter fraction (0.0 to 1.0). The delay is perturbed uniformly within
    /// `[-jitter, +jitter]` of its base value.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::preset(RetryPreset::Exponential)
    }
}

/// Named retry parameter bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPreset {
    /// Doubling delays starting at one second.
    Exponential,
    /// Constant one-second delays with jitter.
    Linear,
    /// Constant one-second delays, no jitter.
    Fixed,
    /// Many fast retries.
    Aggressive,
    /// Few slow retries.
    Conservative,
}

impl RetryConfig {
    /// Returns the parameters for a named preset.
    pub fn preset(preset: RetryPreset) -> Self {
        match preset {
            RetryPreset::Exponential => Self {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.1,
            },
            RetryPreset::Linear => Self {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 1.0,
                jitter: 0.1,
            },
            RetryPreset::Fixed => Self {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(1000),
                multiplier: 1.0,
                jitter: 0.0,
            },
            RetryPreset::Aggressive => Self {
                max_attempts: 5,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                multiplier: 1.5,
                jitter: 0.2,
            },
            RetryPreset::Conservative => Self {
                max_attempts: 2,
                initial_delay: Duration::from_millis(2000),
                max_delay: Duration::from_secs(60),
                multiplier: 3.0,
                jitter: 0.1,
            },
        }
    }

    /// Creates a configuration that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Sets the maximum number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction, clamped to `[0, 1]`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SdkResult<()> {
        if self.max_attempts == 0 {
            return Err(SdkError::configuration("Retry max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(SdkError::configuration(
                "Retry multiplier must be a positive number",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SdkError::configuration("Retry jitter must be within [0, 1]"));
        }
        Ok(())
    }
}

/// `initial_delay * multiplier^(attempt-1)` in seconds, before jitter and cap.
fn exponential_secs(attempt: u32, config: &RetryConfig) -> f64 {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    config.initial_delay.as_secs_f64() * config.multiplier.powi(exponent)
}

/// Clamps to `[0, max_delay]`; non-finite values become zero.
fn clamp_secs(secs: f64, config: &RetryConfig) -> Duration {
    let clamped = secs.clamp(0.0, config.max_delay.as_secs_f64());
    Duration::from_secs_f64(if clamped.is_finite() { clamped } else { 0.0 })
}

/// Un-jittered delay after `attempt` (1-indexed), capped at `max_delay`.
pub(crate) fn base_delay(attempt: u32, config: &RetryConfig) -> Duration {
    clamp_secs(exponential_secs(attempt, config), config)
}

/// Returns the delay to sleep after failed attempt `attempt` (1-indexed).
///
/// `initial_delay * multiplier^(attempt-1)`, perturbed by a uniform random
/// fraction in `[-jitter, +jitter]`, then clamped to `[0, max_delay]`.
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    if config.jitter <= 0.0 {
        return base_delay(attempt, config);
    }
    let jitter = (rand::random::<f64>() * 2.0 - 1.0) * config.jitter;
    clamp_secs(exponential_secs(attempt, config) * (1.0 + jitter), config)
}

/// Context passed to retry hooks.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// The attempt that just failed (1-indexed).
    pub attempt: u32,
    /// Maximum attempts allowed.
    pub max_attempts: u32,
    /// The error that triggered the retry.
    pub error: SdkError,
    /// Delay before the next attempt.
    pub delay: Duration,
}

/// Hook notified before each retry sleep.
#[async_trait]
pub trait RetryHook: Send + Sync {
    /// Called after a failed attempt that will be retried.
    async fn on_retry(&self, context: RetryContext);
}

/// Predicate deciding whether a failed attempt should be retried.
pub type ShouldRetry = Arc<dyn Fn(&SdkError, u32) -> bool + Send + Sync>;

/// Default retry predicate: defers to [`SdkError::is_retryable`].
pub fn default_should_retry(error: &SdkError, _attempt: u32) -> bool {
    error.is_retryable()
}

/// Stateless retry loop over an async operation.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    should_retry: ShouldRetry,
    hook: Option<Arc<dyn RetryHook>>,
}

impl RetryPolicy {
    /// Creates a retry policy with the default retryability classifier.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: Arc::new(default_should_retry),
            hook: None,
        }
    }

    /// Replaces the retry predicate.
    pub fn with_should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&SdkError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Sets a retry hook.
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, attempts are exhausted, or the
    /// predicate declines to retry. The last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> SdkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SdkResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if attempt >= max_attempts || !(self.should_retry)(&error, attempt) {
                if attempt > 1 {
                    warn!(attempt, error = %error, "Giving up after retries");
                }
                return Err(error);
            }

            let delay = calculate_delay(attempt, &self.config);
            debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );

            if let Some(hook) = &self.hook {
                hook.on_retry(RetryContext {
                    attempt,
                    max_attempts,
                    error: error.clone(),
                    delay,
                })
                .await;
            }

            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

/// Runs `operation` under `config` with the default retry predicate.
pub async fn with_retry<F, Fut, T>(operation: F, config: &RetryConfig) -> SdkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SdkResult<T>>,
{
    RetryPolicy::new(config.clone()).execute(operation).await
}
