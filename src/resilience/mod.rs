//! Resilience patterns for the request pipeline.
//!
//! Provides retry logic, circuit breaking, and rate limiting.

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerStats, CircuitState,
    FailurePredicate,
};
pub use rate_limiter::{
    RateLimitScope, RateLimitStatus, RateLimitStrategy, RateLimiter, RateLimiterConfig,
    DEFAULT_QUEUE_POLL_INTERVAL,
};
pub use retry::{
    calculate_delay, default_should_retry, with_retry, RetryConfig, RetryContext,
    RetryHook, RetryPolicy, RetryPreset, ShouldRetry,
};
