//! Resilient HTTP Client Core
//!
//! A request pipeline that keeps an SDK usable over unreliable networks,
//! overloaded servers, and bursty callers.
//!
//! # Features
//!
//! - **Caching**: TTL response cache with creation-order eviction
//! - **Rate Limiting**: fixed-window limiter with throw, wait, and queue strategies
//! - **Circuit Breaking**: rolling-window breaker with a single half-open probe
//! - **Retries**: exponential backoff with jitter and named presets
//! - **Batching**: debounced request coalescing with per-item results
//! - **Instrumentation**: request/response/error interceptors and a typed event stream
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use resilient_client::{CacheConfig, Client, ClientConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder()
//!         .base_url("https://api.example.com")
//!         .api_key("your-api-key")
//!         .cache(CacheConfig::with_ttl(Duration::from_secs(30)))
//!         .build()?;
//!
//!     let client = Client::new(config)?;
//!     let user: serde_json::Value = client.get("/users/42").await?;
//!     println!("{user}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod interceptors;
pub mod observability;
pub mod resilience;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use batch::{BatchConfig, BatchFailureMode, BatchHandler, BatchProcessor};
pub use cache::{cache_key, Cache, CacheConfig, CacheStats};
pub use client::{ApiResponse, Client, ClientBuilder, RequestOptions};
pub use config::{ClientConfig, ClientConfigBuilder, Environment};
pub use errors::{ErrorRecord, SdkError, SdkResult};
pub use events::{EventChannel, EventEmitter, EventListener, SdkEvent};
pub use interceptors::{ErrorInterceptor, InterceptorManager, RequestInterceptor, ResponseInterceptor};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitScope, RateLimitStrategy,
    RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy, RetryPreset,
};
pub use subscription::Subscription;
pub use transport::{Method, ReqwestTransport, Transport, TransportRequest, TransportResponse};

/// Mock implementations for testing.
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
