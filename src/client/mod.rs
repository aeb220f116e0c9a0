//! The client and its request pipeline.
//!
//! Every call goes through the same steps: cache lookup, request
//! interceptors, rate limiter admission, circuit breaker, transport, retry,
//! response interceptors, cache store. Each step publishes events on the
//! client's [`EventEmitter`].

mod hooks;
mod types;

pub use types::{ApiResponse, RequestOptions};

use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::hooks::{error_record, BatchEndpoint, BreakerEvents, RetryEvents};
use crate::batch::BatchProcessor;
use crate::cache::{cache_key, Cache};
use crate::config::ClientConfig;
use crate::errors::{error_from_response, SdkError, SdkResult};
use crate::events::{EventEmitter, SdkEvent};
use crate::interceptors::InterceptorManager;
use crate::observability::redact_headers;
use crate::resilience::{
    CircuitBreaker, FailurePredicate, RateLimitScope, RateLimiter, RetryPolicy, ShouldRetry,
};
use crate::subscription::Subscription;
use crate::transport::{Method, ReqwestTransport, Transport, TransportRequest};

/// Rate limit key used when every request shares one bucket.
pub const GLOBAL_RATE_LIMIT_KEY: &str = "global";

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    cache: Option<Cache<ApiResponse>>,
    rate_limiter: Option<RateLimiter>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy>,
    batch: Option<BatchProcessor<serde_json::Value, serde_json::Value>>,
    interceptors: InterceptorManager,
    events: EventEmitter,
}

/// Resilient HTTP client.
///
/// Cloning is cheap; clones share the cache, rate limiter, circuit breaker,
/// batch queue, interceptors, and listeners.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Client {
    /// Creates a client using the reqwest transport.
    pub fn new(config: ClientConfig) -> SdkResult<Self> {
        ClientBuilder::new(config).build()
    }

    /// Creates a client from `SDK_*` environment variables.
    pub fn from_env() -> SdkResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Creates a client builder.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the response cache, if enabled.
    pub fn cache(&self) -> Option<&Cache<ApiResponse>> {
        self.inner.cache.as_ref()
    }

    /// Returns the rate limiter, if enabled.
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.inner.rate_limiter.as_ref()
    }

    /// Returns the circuit breaker, if enabled.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.inner.circuit_breaker.as_ref()
    }

    /// Returns the batch processor, if enabled.
    pub fn batch_processor(&self) -> Option<&BatchProcessor<serde_json::Value, serde_json::Value>> {
        self.inner.batch.as_ref()
    }

    /// Returns the event emitter.
    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    /// Returns the interceptor chains.
    pub fn interceptors(&self) -> &InterceptorManager {
        &self.inner.interceptors
    }

    /// Registers a request interceptor.
    pub fn on_request<F, Fut>(&self, f: F) -> Subscription
    where
        F: Fn(RequestOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<RequestOptions>> + Send + 'static,
    {
        self.inner.interceptors.on_request(f)
    }

    /// Registers a response interceptor.
    pub fn on_response<F, Fut>(&self, f: F) -> Subscription
    where
        F: Fn(ApiResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<ApiResponse>> + Send + 'static,
    {
        self.inner.interceptors.on_response(f)
    }

    /// Registers an error interceptor.
    pub fn on_error<F, Fut>(&self, f: F) -> Subscription
    where
        F: Fn(SdkError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkError> + Send + 'static,
    {
        self.inner.interceptors.on_error(f)
    }

    /// Sends a request and deserializes the JSON body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> SdkResult<T> {
        self.request_raw(path, options).await?.into_data()
    }

    /// Sends a GET request.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> SdkResult<T> {
        self.request(path, RequestOptions::get()).await
    }

    /// Sends a POST request with a JSON body.
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> SdkResult<T> {
        self.request(path, RequestOptions::with_body(Method::Post, body)?)
            .await
    }

    /// Sends a PUT request with a JSON body.
    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> SdkResult<T> {
        self.request(path, RequestOptions::with_body(Method::Put, body)?)
            .await
    }

    /// Sends a PATCH request with a JSON body.
    pub async fn patch<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> SdkResult<T> {
        self.request(path, RequestOptions::with_body(Method::Patch, body)?)
            .await
    }

    /// Sends a DELETE request.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> SdkResult<T> {
        self.request(path, RequestOptions::delete()).await
    }

    /// Sends a request and returns the raw response.
    ///
    /// Errors pass through the error interceptors and are published on the
    /// `error` channel before being returned.
    pub async fn request_raw(&self, path: &str, options: RequestOptions) -> SdkResult<ApiResponse> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let method = options.method;

        match self.run_pipeline(path, options, &request_id, started).await {
            Ok(response) => Ok(response),
            Err(error) => {
                let error = self
                    .inner
                    .interceptors
                    .apply_error(error.with_request_id(&request_id))
                    .await;

                warn!(
                    request_id = %request_id,
                    method = %method,
                    path,
                    code = error.code(),
                    error = %error,
                    "Request failed"
                );

                self.inner
                    .events
                    .emit(SdkEvent::Error {
                        request_id: request_id.clone(),
                        method: method.to_string(),
                        path: path.to_string(),
                        error: error_record(&error, self.inner.config.environment),
                        duration_ms: started.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                    })
                    .await;

                Err(error)
            }
        }
    }

    /// Queues a payload for the batch endpoint and waits for its own result.
    pub async fn request_batched(&self, payload: serde_json::Value) -> SdkResult<serde_json::Value> {
        match &self.inner.batch {
            Some(batch) => batch.add(payload).await,
            None => Err(SdkError::configuration("Batching is not enabled for this client")),
        }
    }

    /// Flushes queued batch items so no caller is left waiting.
    pub async fn shutdown(&self) {
        if let Some(batch) = &self.inner.batch {
            batch.flush().await;
        }
        info!("Client shut down");
    }

    async fn run_pipeline(
        &self,
        path: &str,
        options: RequestOptions,
        request_id: &str,
        started: Instant,
    ) -> SdkResult<ApiResponse> {
        let inner = &self.inner;
        let method = options.method;
        let key = cache_key(method.as_str(), path, &options.query, options.body.as_ref());
        let cache = inner
            .cache
            .as_ref()
            .filter(|c| c.is_enabled() && method == Method::Get && !options.skip_cache);

        if let Some(cache) = cache {
            let hit = cache.get(&key);
            inner
                .events
                .emit(SdkEvent::Cache {
                    key: key.clone(),
                    hit: hit.is_some(),
                    timestamp: Utc::now(),
                })
                .await;

            if let Some(response) = hit {
                debug!(request_id, key = %key, "Serving response from cache");
                self.emit_response(request_id, method, path, &response, true, started)
                    .await;
                return Ok(response);
            }
        }

        let options = inner.interceptors.apply_request(options).await?;
        let request = self.build_request(path, &options, request_id)?;
        let timeout = options.timeout.unwrap_or(inner.config.timeout);

        inner
            .events
            .emit(SdkEvent::Request {
                request_id: request_id.to_string(),
                method: request.method.to_string(),
                url: request.url.clone(),
                headers: redact_headers(&request.headers),
                timestamp: Utc::now(),
            })
            .await;

        let limit_key = self.rate_limit_key(options.method, path);
        let limit_key = limit_key.as_str();
        let request = &request;
        let attempt = move || self.attempt(request.clone(), limit_key, timeout, request_id);

        let response = match &inner.retry {
            Some(policy) => {
                policy
                    .clone()
                    .with_hook(Arc::new(RetryEvents {
                        events: inner.events.clone(),
                        request_id: request_id.to_string(),
                        environment: inner.config.environment,
                    }))
                    .execute(attempt)
                    .await
            }
            None => attempt().await,
        }?;

        let response = inner.interceptors.apply_response(response).await?;

        if let Some(cache) = cache {
            if options.method == Method::Get {
                cache.set(key, response.clone(), None);
            }
        }

        self.emit_response(request_id, options.method, path, &response, false, started)
            .await;
        Ok(response)
    }

    /// One retryable unit of work: admission, breaker, transport.
    async fn attempt(
        &self,
        request: TransportRequest,
        limit_key: &str,
        timeout: Duration,
        request_id: &str,
    ) -> SdkResult<ApiResponse> {
        if let Some(limiter) = &self.inner.rate_limiter {
            self.admit(limiter, limit_key).await?;
        }

        match &self.inner.circuit_breaker {
            Some(breaker) => {
                breaker
                    .execute(|| self.send_once(request, timeout, request_id))
                    .await
            }
            None => self.send_once(request, timeout, request_id).await,
        }
    }

    async fn admit(&self, limiter: &RateLimiter, key: &str) -> SdkResult<()> {
        let result = limiter.check(key).await;
        let status = limiter.status(key);

        self.inner
            .events
            .emit(SdkEvent::RateLimit {
                key: key.to_string(),
                admitted: result.is_ok(),
                remaining: status.remaining,
                reset_in_ms: status.reset_in.as_millis() as u64,
                queued: status.queued,
                timestamp: Utc::now(),
            })
            .await;

        result
    }

    async fn send_once(
        &self,
        request: TransportRequest,
        timeout: Duration,
        request_id: &str,
    ) -> SdkResult<ApiResponse> {
        let cancel = CancellationToken::new();

        let response = tokio::select! {
            result = self.inner.transport.send(request, cancel.clone()) => result?,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                debug!(request_id, timeout_ms = timeout.as_millis() as u64, "Attempt timed out");
                return Err(SdkError::Timeout {
                    timeout,
                    request_id: Some(request_id.to_string()),
                });
            }
        };

        if !response.is_success() {
            return Err(error_from_response(
                response.status,
                &response.headers,
                &response.body,
            ));
        }

        Ok(ApiResponse {
            status: response.status,
            data: ApiResponse::parse_body(&response.body),
            headers: response.headers,
        })
    }

    fn build_request(
        &self,
        path: &str,
        options: &RequestOptions,
        request_id: &str,
    ) -> SdkResult<TransportRequest> {
        let config = &self.inner.config;

        let mut url = url::Url::parse(&config.endpoint_url(path))?;
        if !options.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &options.query {
                pairs.append_pair(name, value);
            }
        }

        let body = options
            .body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?
            .map(Bytes::from);

        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert("accept".into(), "application/json".into());
        headers.insert("user-agent".into(), config.user_agent.clone());
        headers.insert("x-request-id".into(), request_id.to_string());
        if body.is_some() {
            headers.insert("content-type".into(), "application/json".into());
        }
        if let Some(api_key) = config.api_key() {
            headers.insert("authorization".into(), format!("Bearer {api_key}"));
        }
        for (name, value) in config.default_headers.iter().chain(&options.headers) {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        Ok(TransportRequest {
            method: options.method,
            url: url.to_string(),
            headers,
            body,
        })
    }

    fn rate_limit_key(&self, method: Method, path: &str) -> String {
        match self
            .inner
            .rate_limiter
            .as_ref()
            .map(|l| l.config().scope)
            .unwrap_or_default()
        {
            RateLimitScope::Global => GLOBAL_RATE_LIMIT_KEY.to_string(),
            RateLimitScope::PerEndpoint => format!("{method}:{path}"),
        }
    }

    async fn emit_response(
        &self,
        request_id: &str,
        method: Method,
        path: &str,
        response: &ApiResponse,
        cached: bool,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(request_id, status = response.status, cached, duration_ms, "Request completed");

        self.inner
            .events
            .emit(SdkEvent::Response {
                request_id: request_id.to_string(),
                method: method.to_string(),
                path: path.to_string(),
                status: response.status,
                cached,
                duration_ms,
                timestamp: Utc::now(),
            })
            .await;
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    failure_predicate: Option<FailurePredicate>,
    should_retry: Option<ShouldRetry>,
}

impl ClientBuilder {
    /// Creates a builder from a configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            failure_predicate: None,
            should_retry: None,
        }
    }

    /// Uses a custom transport instead of reqwest.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets which errors count toward the circuit breaker threshold.
    pub fn failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&SdkError) -> bool + Send + Sync + 'static,
    {
        self.failure_predicate = Some(Arc::new(predicate));
        self
    }

    /// Sets which errors are retried.
    pub fn should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&SdkError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Builds the client.
    pub fn build(self) -> SdkResult<Client> {
        let Self {
            config,
            transport,
            failure_predicate,
            should_retry,
        } = self;

        let transport: Arc<dyn Transport> = match transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(config.timeout)?),
        };
        let events = EventEmitter::new();

        let circuit_breaker = config.circuit_breaker.clone().map(|breaker_config| {
            let breaker = CircuitBreaker::new(breaker_config).with_hook(Arc::new(BreakerEvents {
                events: events.clone(),
            }));
            match failure_predicate {
                Some(predicate) => breaker.with_failure_predicate(move |e| predicate(e)),
                None => breaker,
            }
        });

        let retry = config.retry.clone().map(|retry_config| {
            let policy = RetryPolicy::new(retry_config);
            match should_retry {
                Some(predicate) => policy.with_should_retry(move |e, attempt| predicate(e, attempt)),
                None => policy,
            }
        });

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| ClientInner {
            cache: config.cache.clone().map(Cache::new),
            rate_limiter: config.rate_limit.clone().map(RateLimiter::new),
            batch: config.batch.clone().map(|batch_config| {
                BatchProcessor::new(
                    batch_config,
                    Arc::new(BatchEndpoint {
                        client: weak.clone(),
                        path: config.batch_path.clone(),
                    }),
                )
            }),
            circuit_breaker,
            retry,
            transport,
            interceptors: InterceptorManager::new(),
            events,
            config,
        });

        info!(
            base_url = %inner.config.base_url,
            cache = inner.cache.is_some(),
            rate_limit = inner.rate_limiter.is_some(),
            circuit_breaker = inner.circuit_breaker.is_some(),
            retry = inner.retry.is_some(),
            batch = inner.batch.is_some(),
            "Client initialized"
        );

        Ok(Client { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::cache::CacheConfig;
    use crate::events::EventChannel;
    use crate::mocks::{MockResponse, MockTransport};
    use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn config() -> crate::config::ClientConfigBuilder {
        ClientConfig::builder().base_url("https://api.example.com")
    }

    fn client_with(
        config: crate::config::ClientConfigBuilder,
        transport: Arc<MockTransport>,
    ) -> Client {
        Client::builder(config.build().unwrap())
            .transport(transport)
            .build()
            .unwrap()
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(10))
            .jitter(0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_get_skips_transport_until_ttl_elapses() {
        let transport = Arc::new(
            MockTransport::new().with_default_response(MockResponse::ok(json!({ "a": 1 }))),
        );
        let client = client_with(
            config()
                .cache(CacheConfig::with_ttl(Duration::from_millis(1000)))
                .retry(RetryConfig::default().max_attempts(1)),
            transport.clone(),
        );

        let first: Value = client.get("/x").await.unwrap();
        let second: Value = client.get("/x").await.unwrap();

        assert_eq!(first, json!({ "a": 1 }));
        assert_eq!(first, second);
        assert_eq!(transport.request_count(), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        let third: Value = client.get("/x").await.unwrap();

        assert_eq!(third, first);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cache_and_non_get_bypass_cache() {
        let transport = Arc::new(
            MockTransport::new().with_default_response(MockResponse::ok(json!({ "ok": true }))),
        );
        let client = client_with(
            config().cache(CacheConfig::with_ttl(Duration::from_secs(60))),
            transport.clone(),
        );

        let _: Value = client.get("/x").await.unwrap();
        let _: Value = client
            .request("/x", RequestOptions::get().skip_cache())
            .await
            .unwrap();
        let _: Value = client.post("/x", &json!({})).await.unwrap();
        let _: Value = client.post("/x", &json!({})).await.unwrap();

        assert_eq!(transport.request_count(), 4);
        assert_eq!(client.cache().map(|c| c.len()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_status_is_retried() {
        let transport = Arc::new(MockTransport::new());
        transport.enqueue_response(MockResponse::error(503, "busy"));
        transport.enqueue_response(MockResponse::ok(json!({ "done": true })));
        let client = client_with(config().retry(fast_retry(3)), transport.clone());

        let retries = Arc::new(Mutex::new(Vec::new()));
        let seen = retries.clone();
        let _sub = client.events().on(EventChannel::Retry, move |event| {
            if let SdkEvent::Retry { attempt, .. } = event {
                seen.lock().push(*attempt);
            }
        });

        let value: Value = client.get("/jobs").await.unwrap();

        assert_eq!(value, json!({ "done": true }));
        assert_eq!(transport.request_count(), 2);
        assert_eq!(*retries.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried_and_is_structured() {
        let transport = Arc::new(MockTransport::new());
        transport.enqueue_response(
            MockResponse::json(
                422,
                json!({ "error": { "message": "name is required", "code": "VALIDATION" } }),
            )
            .with_header("x-request-id", "srv-1"),
        );
        let client = client_with(config().retry(fast_retry(3)), transport.clone());

        let error = client.get::<Value>("/users").await.unwrap_err();

        assert_eq!(transport.request_count(), 1);
        assert_eq!(error.status(), Some(422));
        assert_eq!(error.code(), "VALIDATION");
        assert_eq!(error.message(), "name is required");
        assert_eq!(error.request_id(), Some("srv-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_cancels_transport() {
        let transport = Arc::new(MockTransport::new());
        transport.enqueue_response(
            MockResponse::ok(json!({})).with_delay(Duration::from_secs(5)),
        );
        let client = client_with(config().no_retry(), transport.clone());

        let error = client
            .request::<Value>("/slow", RequestOptions::get().timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(error, SdkError::Timeout { .. }));
        assert!(error.request_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_fails_fast() {
        let transport = Arc::new(
            MockTransport::new().with_default_response(MockResponse::error(500, "down")),
        );
        let client = client_with(
            config()
                .no_retry()
                .circuit_breaker(CircuitBreakerConfig::default().failure_threshold(2)),
            transport.clone(),
        );

        for _ in 0..2 {
            client.get::<Value>("/x").await.unwrap_err();
        }
        let error = client.get::<Value>("/x").await.unwrap_err();

        assert!(matches!(error, SdkError::CircuitOpen { .. }));
        assert_eq!(transport.request_count(), 2);
        assert!(client.circuit_breaker().unwrap().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_throw_rejects_without_sending() {
        let transport = Arc::new(
            MockTransport::new().with_default_response(MockResponse::ok(json!({}))),
        );
        let client = client_with(
            config()
                .no_retry()
                .rate_limit(RateLimiterConfig::new(1, Duration::from_secs(60))),
            transport.clone(),
        );

        let _: Value = client.get("/x").await.unwrap();
        let error = client.get::<Value>("/x").await.unwrap_err();

        assert!(matches!(error, SdkError::RateLimited { .. }));
        assert_eq!(transport.request_count(), 1);
        assert_eq!(
            client.rate_limiter().unwrap().status(GLOBAL_RATE_LIMIT_KEY).remaining,
            0
        );
    }

    #[tokio::test]
    async fn test_request_carries_headers_query_and_body() {
        let transport = Arc::new(
            MockTransport::new().with_default_response(MockResponse::ok(json!({}))),
        );
        let client = client_with(
            config().api_key("secret").header("X-Tenant", "acme"),
            transport.clone(),
        );

        let _: Value = client
            .request(
                "/search",
                RequestOptions::default()
                    .method(Method::Post)
                    .query("q", "rust lang")
                    .query("page", 2)
                    .body(json!({ "filter": "all" })),
            )
            .await
            .unwrap();

        let request = transport.last_request().unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(
            request.url,
            "https://api.example.com/search?page=2&q=rust+lang"
        );
        assert_eq!(request.headers["authorization"], "Bearer secret");
        assert_eq!(request.headers["x-tenant"], "acme");
        assert_eq!(request.headers["content-type"], "application/json");
        assert!(request.headers.contains_key("x-request-id"));
        let body: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({ "filter": "all" }));
    }

    #[tokio::test]
    async fn test_interceptors_transform_each_phase() {
        let transport = Arc::new(MockTransport::new());
        transport.enqueue_response(MockResponse::ok(json!({ "n": 1 })));
        transport.enqueue_response(MockResponse::error(404, "missing"));
        let client = client_with(config().no_retry(), transport.clone());

        let _req = client.on_request(|options: RequestOptions| async move {
            Ok(options.header("x-intercepted", "yes"))
        });
        let _res = client.on_response(|mut response: ApiResponse| async move {
            response.data = json!({ "wrapped": response.data });
            Ok(response)
        });
        let _err = client.on_error(|_error: SdkError| async move {
            SdkError::configuration("rewritten")
        });

        let value: Value = client.get("/a").await.unwrap();
        assert_eq!(value, json!({ "wrapped": { "n": 1 } }));
        assert_eq!(transport.requests()[0].headers["x-intercepted"], "yes");

        let error = client.get::<Value>("/b").await.unwrap_err();
        assert!(matches!(error, SdkError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let transport = Arc::new(MockTransport::new());
        transport.enqueue_response(MockResponse::ok(json!({})));
        transport.enqueue_response(MockResponse::error(400, "bad"));
        let client = client_with(config().no_retry(), transport);

        let channels = Arc::new(Mutex::new(Vec::new()));
        let mut subscriptions = Vec::new();
        for channel in [EventChannel::Request, EventChannel::Response, EventChannel::Error] {
            let seen = channels.clone();
            subscriptions.push(client.events().on(channel, move |event| {
                seen.lock().push(event.channel());
            }));
        }

        let _: Value = client.get("/ok").await.unwrap();
        client.get::<Value>("/bad").await.unwrap_err();

        assert_eq!(
            *channels.lock(),
            vec![
                EventChannel::Request,
                EventChannel::Response,
                EventChannel::Request,
                EventChannel::Error,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_batched_coalesces_payloads() {
        let transport = Arc::new(MockTransport::new());
        transport.enqueue_response(MockResponse::ok(json!([{ "id": 1 }, null])));
        let client = client_with(
            config()
                .no_retry()
                .batch(BatchConfig::new(2, Duration::from_millis(20))),
            transport.clone(),
        );

        let (first, second) = tokio::join!(
            client.request_batched(json!({ "op": "a" })),
            client.request_batched(json!({ "op": "b" })),
        );

        assert_eq!(first.unwrap(), json!({ "id": 1 }));
        assert!(matches!(second, Err(SdkError::Batch { .. })));

        let request = transport.last_request().unwrap();
        assert!(request.url.ends_with("/batch"));
        let body: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({ "requests": [{ "op": "a" }, { "op": "b" }] }));
    }

    #[tokio::test]
    async fn test_request_batched_requires_configuration() {
        let client = client_with(config(), Arc::new(MockTransport::new()));
        let result = client.request_batched(json!({})).await;
        assert!(matches!(result, Err(SdkError::Configuration { .. })));
    }
}
