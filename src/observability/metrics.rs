//! Event-driven request metrics.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::SdkResult;
use crate::events::{EventListener, SdkEvent};

/// Aggregated counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests sent to the transport path (cache hits excluded).
    pub requests: u64,
    /// Successful responses, cached ones included.
    pub successes: u64,
    /// Failed requests.
    pub errors: u64,
    /// Failed requests by error code.
    pub errors_by_code: HashMap<String, u64>,
    /// Scheduled retries.
    pub retries: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Rate limiter rejections.
    pub rate_limit_rejections: u64,
    /// Circuit breaker transitions, keyed `from->to`.
    pub breaker_transitions: HashMap<String, u64>,
    /// Mean latency of completed requests in milliseconds.
    pub avg_latency_ms: f64,
}

/// Listener that aggregates client events into counters.
///
/// Subscribe it on every channel with
/// [`EventEmitter::subscribe_all`](crate::events::EventEmitter::subscribe_all).
#[derive(Debug, Default)]
pub struct MetricsListener {
    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limit_rejections: AtomicU64,
    completed: AtomicU64,
    total_latency_ms: AtomicU64,
    errors_by_code: RwLock<HashMap<String, u64>>,
    breaker_transitions: RwLock<HashMap<String, u64>>,
}

impl MetricsListener {
    /// Creates a listener with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one event.
    pub fn record(&self, event: &SdkEvent) {
        match event {
            SdkEvent::Request { .. } => {
                self.requests.fetch_add(1, Ordering::Relaxed);
            }
            SdkEvent::Response { duration_ms, .. } => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.record_latency(*duration_ms);
            }
            SdkEvent::Error {
                error, duration_ms, ..
            } => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.record_latency(*duration_ms);
                let code = error.code.clone().unwrap_or_else(|| "UNKNOWN".to_string());
                *self.errors_by_code.write().entry(code).or_insert(0) += 1;
            }
            SdkEvent::Retry { .. } => {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            SdkEvent::Cache { hit: true, .. } => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            SdkEvent::Cache { hit: false, .. } => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            SdkEvent::RateLimit { admitted, .. } => {
                if !admitted {
                    self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
                }
            }
            SdkEvent::CircuitBreaker { from, to, .. } => {
                *self
                    .breaker_transitions
                    .write()
                    .entry(format!("{from}->{to}"))
                    .or_insert(0) += 1;
            }
        }
    }

    fn record_latency(&self, duration_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    /// Returns the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let avg_latency_ms = if completed > 0 {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / completed as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            errors_by_code: self.errors_by_code.read().clone(),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.read().clone(),
            avg_latency_ms,
        }
    }

    /// Resets every counter.
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.successes,
            &self.errors,
            &self.retries,
            &self.cache_hits,
            &self.cache_misses,
            &self.rate_limit_rejections,
            &self.completed,
            &self.total_latency_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.errors_by_code.write().clear();
        self.breaker_transitions.write().clear();
    }
}

#[async_trait]
impl EventListener for MetricsListener {
    async fn on_event(&self, event: &SdkEvent) -> SdkResult<()> {
        self.record(event);
        Ok(())
    }
}
