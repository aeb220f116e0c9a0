//! Typed publish/subscribe for client lifecycle events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

use crate::errors::{ErrorRecord, SdkResult};
use crate::subscription::Subscription;

/// Event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventChannel {
    /// A request is about to be sent.
    Request,
    /// A request completed successfully.
    Response,
    /// A request failed.
    Error,
    /// An attempt failed and another is scheduled.
    Retry,
    /// Cache lookup outcome.
    Cache,
    /// Rate limiter admission outcome.
    RateLimit,
    /// Circuit breaker state change.
    CircuitBreaker,
}

impl EventChannel {
    /// All channels.
    pub const ALL: [EventChannel; 7] = [
        EventChannel::Request,
        EventChannel::Response,
        EventChannel::Error,
        EventChannel::Retry,
        EventChannel::Cache,
        EventChannel::RateLimit,
        EventChannel::CircuitBreaker,
    ];
}

/// An event published by the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SdkEvent {
    /// Emitted after request interceptors ran, before admission.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Request identifier.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Full request URL.
        url: String,
        /// Outgoing headers, with credentials redacted.
        headers: HashMap<String, String>,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// Emitted when a request produced a result.
    #[serde(rename_all = "camelCase")]
    Response {
        /// Request identifier.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// HTTP status.
        status: u16,
        /// Whether the response came from the cache.
        cached: bool,
        /// Elapsed time in milliseconds.
        duration_ms: u64,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// Emitted when a request failed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Request identifier.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// The normalized error.
        error: ErrorRecord,
        /// Elapsed time in milliseconds.
        duration_ms: u64,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// Emitted before sleeping between attempts.
    #[serde(rename_all = "camelCase")]
    Retry {
        /// Request identifier.
        request_id: String,
        /// The attempt that failed (1-indexed).
        attempt: u32,
        /// Configured attempt limit.
        max_attempts: u32,
        /// Sleep before the next attempt, in milliseconds.
        delay_ms: u64,
        /// The error that triggered the retry.
        error: ErrorRecord,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// Emitted for every cache lookup.
    #[serde(rename_all = "camelCase")]
    Cache {
        /// Cache key.
        key: String,
        /// Whether the lookup hit.
        hit: bool,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// Emitted after a rate limiter admission check.
    #[serde(rename_all = "camelCase")]
    RateLimit {
        /// Rate limit key.
        key: String,
        /// Whether the call was admitted.
        admitted: bool,
        /// Remaining admissions in the current window.
        remaining: u32,
        /// Milliseconds until the window resets.
        reset_in_ms: u64,
        /// Callers queued for this key.
        queued: usize,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// Emitted when the circuit breaker changes state.
    #[serde(rename_all = "camelCase")]
    CircuitBreaker {
        /// Previous state.
        from: String,
        /// New state.
        to: String,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
}

impl SdkEvent {
    /// Returns the channel this event is published on.
    pub fn channel(&self) -> EventChannel {
        match self {
            SdkEvent::Request { .. } => EventChannel::Request,
            SdkEvent::Response { .. } => EventChannel::Response,
            SdkEvent::Error { .. } => EventChannel::Error,
            SdkEvent::Retry { .. } => EventChannel::Retry,
            SdkEvent::Cache { .. } => EventChannel::Cache,
            SdkEvent::RateLimit { .. } => EventChannel::RateLimit,
            SdkEvent::CircuitBreaker { .. } => EventChannel::CircuitBreaker,
        }
    }
}

/// Receives events.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handles an event. Errors are logged and never reach the emitter.
    async fn on_event(&self, event: &SdkEvent) -> SdkResult<()>;
}

struct SyncListener<F>(F);

#[async_trait]
impl<F> EventListener for SyncListener<F>
where
    F: Fn(&SdkEvent) + Send + Sync,
{
    async fn on_event(&self, event: &SdkEvent) -> SdkResult<()> {
        (self.0)(event);
        Ok(())
    }
}

struct AsyncListener<F>(F);

#[async_trait]
impl<F, Fut> EventListener for AsyncListener<F>
where
    F: Fn(SdkEvent) -> Fut + Send + Sync,
    Fut: Future<Output = SdkResult<()>> + Send,
{
    async fn on_event(&self, event: &SdkEvent) -> SdkResult<()> {
        (self.0)(event.clone()).await
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    listener: Arc<dyn EventListener>,
    once: bool,
}

#[derive(Default)]
struct EmitterInner {
    listeners: RwLock<HashMap<EventChannel, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EmitterInner {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for registrations in listeners.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
        }
        removed
    }
}

/// Typed event emitter.
///
/// Listeners for one event run concurrently. A listener that fails or panics
/// is logged and does not affect its siblings or the emitter.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.inner.listeners.read();
        let total: usize = listeners.values().map(Vec::len).sum();
        f.debug_struct("EventEmitter").field("listeners", &total).finish()
    }
}

impl EventEmitter {
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, channel: EventChannel, listener: Arc<dyn EventListener>, once: bool) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .listeners
            .write()
            .entry(channel)
            .or_default()
            .push(Registration { id, listener, once });

        let inner: Weak<EmitterInner> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        })
    }

    /// Registers a listener on a channel.
    pub fn subscribe(&self, channel: EventChannel, listener: Arc<dyn EventListener>) -> Subscription {
        self.register(channel, listener, false)
    }

    /// Registers a listener on every channel. Returns one handle per channel.
    pub fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> Vec<Subscription> {
        EventChannel::ALL
            .iter()
            .map(|channel| self.register(*channel, Arc::clone(&listener), false))
            .collect()
    }

    /// Registers a synchronous callback on a channel.
    pub fn on<F>(&self, channel: EventChannel, f: F) -> Subscription
    where
        F: Fn(&SdkEvent) + Send + Sync + 'static,
    {
        self.register(channel, Arc::new(SyncListener(f)), false)
    }

    /// Registers an async callback on a channel.
    pub fn on_async<F, Fut>(&self, channel: EventChannel, f: F) -> Subscription
    where
        F: Fn(SdkEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<()>> + Send + 'static,
    {
        self.register(channel, Arc::new(AsyncListener(f)), false)
    }

    /// Registers a callback that is removed after its first event.
    pub fn once<F>(&self, channel: EventChannel, f: F) -> Subscription
    where
        F: Fn(&SdkEvent) + Send + Sync + 'static,
    {
        self.register(channel, Arc::new(SyncListener(f)), true)
    }

    /// Removes a listener by registration id. Returns true if one was removed.
    pub fn off(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    /// Removes every listener on `channel`, or on all channels when `None`.
    pub fn remove_all(&self, channel: Option<EventChannel>) {
        let mut listeners = self.inner.listeners.write();
        match channel {
            Some(channel) => {
                listeners.remove(&channel);
            }
            None => listeners.clear(),
        }
    }

    /// Returns the number of listeners on a channel.
    pub fn listener_count(&self, channel: EventChannel) -> usize {
        self.inner
            .listeners
            .read()
            .get(&channel)
            .map_or(0, Vec::len)
    }

    /// Publishes an event and waits for every listener to finish.
    pub async fn emit(&self, event: SdkEvent) {
        let channel = event.channel();
        let registrations: Vec<Registration> = {
            let mut listeners = self.inner.listeners.write();
            match listeners.get_mut(&channel) {
                Some(registrations) => {
                    let snapshot = registrations.clone();
                    registrations.retain(|r| !r.once);
                    snapshot
                }
                None => return,
            }
        };

        let results = join_all(registrations.iter().map(|registration| {
            AssertUnwindSafe(registration.listener.on_event(&event)).catch_unwind()
        }))
        .await;

        for (registration, result) in registrations.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    listener = registration.id,
                    channel = ?channel,
                    error = %error,
                    "Event listener failed"
                ),
                Err(_) => warn!(
                    listener = registration.id,
                    channel = ?channel,
                    "Event listener panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SdkError;
    use std::sync::atomic::AtomicUsize;

    fn cache_event(hit: bool) -> SdkEvent {
        SdkEvent::Cache {
            key: "GET:/x".into(),
            hit,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_on_receives_events_for_its_channel_only() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = emitter.on(EventChannel::Cache, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(cache_event(true)).await;
        emitter
            .emit(SdkEvent::CircuitBreaker {
                from: "closed".into(),
                to: "open".into(),
                timestamp: Utc::now(),
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_fires_a_single_time() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = emitter.once(EventChannel::Cache, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(cache_event(true)).await;
        emitter.emit(cache_event(false)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(EventChannel::Cache), 0);
    }

    #[tokio::test]
    async fn test_off_and_unsubscribe_remove_listeners() {
        let emitter = EventEmitter::new();
        let first = emitter.on(EventChannel::Cache, |_| {});
        let second = emitter.on(EventChannel::Cache, |_| {});
        assert_eq!(emitter.listener_count(EventChannel::Cache), 2);

        assert!(emitter.off(first.id()));
        assert!(!emitter.off(first.id()));
        second.unsubscribe();

        assert_eq!(emitter.listener_count(EventChannel::Cache), 0);
    }

    #[tokio::test]
    async fn test_failing_listeners_do_not_affect_siblings() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _panics = emitter.on(EventChannel::Cache, |_| panic!("listener bug"));
        let _fails = emitter.on_async(EventChannel::Cache, |_| async {
            Err(SdkError::configuration("listener failed"))
        });
        let seen = count.clone();
        let _counts = emitter.on(EventChannel::Cache, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(cache_event(true)).await;
        emitter.emit(cache_event(true)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.listener_count(EventChannel::Cache), 3);
    }

    #[tokio::test]
    async fn test_remove_all_by_channel() {
        let emitter = EventEmitter::new();
        let _a = emitter.on(EventChannel::Cache, |_| {});
        let _b = emitter.on(EventChannel::Error, |_| {});

        emitter.remove_all(Some(EventChannel::Cache));
        assert_eq!(emitter.listener_count(EventChannel::Cache), 0);
        assert_eq!(emitter.listener_count(EventChannel::Error), 1);

        emitter.remove_all(None);
        assert_eq!(emitter.listener_count(EventChannel::Error), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let value = serde_json::to_value(cache_event(true)).unwrap();
        assert_eq!(value["type"], "cache");
        assert_eq!(value["hit"], true);
    }
}
