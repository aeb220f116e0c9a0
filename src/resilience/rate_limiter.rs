//! Fixed-window rate limiter with per-key buckets.
//!
//! Each key gets a bucket counting admissions in the current window. The window
//! does not slide: once `reset_at` passes the bucket is replaced by a fresh one.
//! What happens to a caller that finds its bucket full depends on the
//! configured [`RateLimitStrategy`].

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{SdkError, SdkResult};

/// Default pause between admission attempts for the queue head.
pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to do with a caller whose bucket is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    /// Fail immediately with [`SdkError::RateLimited`].
    Throw,
    /// Sleep until the window resets, then recheck.
    Wait,
    /// Join a FIFO queue drained by a single loop.
    Queue,
}

/// How the client derives the rate limit key for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitScope {
    /// All requests share one bucket.
    #[default]
    Global,
    /// One bucket per method and path.
    PerEndpoint,
}

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum admissions per key per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
    /// Behavior once a bucket is full.
    pub strategy: RateLimitStrategy,
    /// Pause between admission attempts for a blocked queue head.
    pub queue_poll_interval: Duration,
    /// How the client derives keys.
    pub scope: RateLimitScope,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            strategy: RateLimitStrategy::Throw,
            queue_poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
            scope: RateLimitScope::Global,
        }
    }
}

impl RateLimiterConfig {
    /// Creates a configuration admitting `max_requests` per `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Default::default()
        }
    }

    /// Sets the strategy.
    pub fn strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the key scope.
    pub fn scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the queue poll interval.
    pub fn queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SdkResult<()> {
        if self.max_requests == 0 {
            return Err(SdkError::configuration(
                "Rate limit max_requests must be at least 1",
            ));
        }
        if self.window.is_zero() {
            return Err(SdkError::configuration(
                "Rate limit window must be greater than zero",
            ));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(SdkError::configuration(
                "Rate limit queue poll interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Per-key counter for the current window.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// Snapshot of a key's admission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Admissions left in the current window.
    pub remaining: u32,
    /// When the current window resets, if one is active.
    pub reset_at: Option<Instant>,
    /// Time until the window resets.
    pub reset_in: Duration,
    /// Callers queued for this key.
    pub queued: usize,
}

struct QueuedCaller {
    key: String,
    admit: oneshot::Sender<()>,
}

struct Inner {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    queue: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<QueuedCaller>,
    draining: bool,
}

impl Inner {
    /// Admits one call for `key` if the bucket has room. On refusal returns the
    /// instant at which the current window resets.
    fn try_admit(&self, key: &str) -> Result<(), Instant> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets
            .entry(key.to_string())
            .and_modify(|bucket| {
                if now >= bucket.reset_at {
                    *bucket = Bucket {
                        count: 0,
                        reset_at: now + self.config.window,
                    };
                }
            })
            .or_insert_with(|| Bucket {
                count: 0,
                reset_at: now + self.config.window,
            });

        if bucket.count >= self.config.max_requests {
            return Err(bucket.reset_at);
        }
        bucket.count += 1;
        Ok(())
    }

    fn discard_if_stale(&self, key: &str) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        if buckets.get(key).is_some_and(|b| now >= b.reset_at) {
            buckets.remove(key);
        }
    }

    async fn drain_queue(self: Arc<Self>) {
        loop {
            let head_key = {
                let mut queue = self.queue.lock();
                match queue.waiting.front() {
                    Some(head) if head.admit.is_closed() => {
                        debug!(key = %head.key, "Dropping abandoned queued caller");
                        queue.waiting.pop_front();
                        continue;
                    }
                    Some(head) => head.key.clone(),
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            match self.try_admit(&head_key) {
                Ok(()) => {
                    let head = self.queue.lock().waiting.pop_front();
                    if let Some(head) = head {
                        if head.admit.send(()).is_err() {
                            debug!(key = %head.key, "Queued caller went away before admission");
                        }
                    }
                }
                Err(_) => tokio::time::sleep(self.config.queue_poll_interval).await,
            }
        }
    }
}

/// Fixed-window rate limiter shared by every request of one client.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Creates a new rate limiter.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                buckets: Mutex::new(HashMap::new()),
                queue: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Admits one call for `key` according to the configured strategy.
    ///
    /// A configuration that can never admit a call fails immediately instead
    /// of blocking.
    pub async fn check(&self, key: &str) -> SdkResult<()> {
        self.inner.config.validate()?;
        match self.inner.config.strategy {
            RateLimitStrategy::Throw => self.check_throw(key),
            RateLimitStrategy::Wait => {
                self.check_wait(key).await;
                Ok(())
            }
            RateLimitStrategy::Queue => self.check_queue(key).await,
        }
    }

    fn check_throw(&self, key: &str) -> SdkResult<()> {
        self.inner.try_admit(key).map_err(|reset_at| {
            let retry_after = reset_at.saturating_duration_since(Instant::now());
            warn!(key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
            SdkError::RateLimited {
                key: key.to_string(),
                retry_after,
            }
        })
    }

    async fn check_wait(&self, key: &str) {
        while let Err(reset_at) = self.inner.try_admit(key) {
            debug!(key, "Rate limit reached, waiting for window reset");
            tokio::time::sleep_until(reset_at).await;
            self.inner.discard_if_stale(key);
        }
    }

    async fn check_queue(&self, key: &str) -> SdkResult<()> {
        let (tx, rx) = oneshot::channel();
        let spawn_drain = {
            let mut queue = self.inner.queue.lock();
            queue.waiting.push_back(QueuedCaller {
                key: key.to_string(),
                admit: tx,
            });
            !std::mem::replace(&mut queue.draining, true)
        };

        if spawn_drain {
            tokio::spawn(self.inner.clone().drain_queue());
        }

        rx.await.map_err(|_| SdkError::Cancelled)
    }

    /// Returns the admission status for `key`.
    pub fn status(&self, key: &str) -> RateLimitStatus {
        let now = Instant::now();
        let queued = self
            .inner
            .queue
            .lock()
            .waiting
            .iter()
            .filter(|c| c.key == key)
            .count();

        match self.inner.buckets.lock().get(key) {
            Some(bucket) if now < bucket.reset_at => RateLimitStatus {
                remaining: self.inner.config.max_requests.saturating_sub(bucket.count),
                reset_at: Some(bucket.reset_at),
                reset_in: bucket.reset_at - now,
                queued,
            },
            _ => RateLimitStatus {
                remaining: self.inner.config.max_requests,
                reset_at: None,
                reset_in: Duration::ZERO,
                queued,
            },
        }
    }

    /// Returns the total number of queued callers across all keys.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().waiting.len()
    }

    /// Drops the bucket for `key`.
    pub fn reset(&self, key: &str) {
        self.inner.buckets.lock().remove(key);
    }

    /// Drops every bucket.
    pub fn reset_all(&self) {
        self.inner.buckets.lock().clear();
    }

    /// Removes buckets whose window has ended. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.inner.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now < bucket.reset_at);
        before - buckets.len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.inner.config)
            .field("buckets", &self.inner.buckets.lock().len())
            .field("queued", &self.queue_len())
            .finish()
    }
}
