//! Request, response, and error interceptors.
//!
//! Each phase holds an ordered chain. Applying a phase threads the value
//! through every registered interceptor in registration order.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::client::{ApiResponse, RequestOptions};
use crate::errors::{SdkError, SdkResult};
use crate::subscription::Subscription;

/// Transforms outgoing request options.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Returns the options to continue with, or an error to abort the request.
    async fn intercept(&self, options: RequestOptions) -> SdkResult<RequestOptions>;
}

/// Transforms successful responses.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    /// Returns the response to continue with.
    async fn intercept(&self, response: ApiResponse) -> SdkResult<ApiResponse>;
}

/// Transforms errors before they reach the caller.
#[async_trait]
pub trait ErrorInterceptor: Send + Sync {
    /// Returns the error to continue with.
    async fn intercept(&self, error: SdkError) -> SdkError;
}

/// Adapter turning an async closure into an interceptor.
pub struct FnInterceptor<F>(pub F);

#[async_trait]
impl<F, Fut> RequestInterceptor for FnInterceptor<F>
where
    F: Fn(RequestOptions) -> Fut + Send + Sync,
    Fut: Future<Output = SdkResult<RequestOptions>> + Send,
{
    async fn intercept(&self, options: RequestOptions) -> SdkResult<RequestOptions> {
        (self.0)(options).await
    }
}

#[async_trait]
impl<F, Fut> ResponseInterceptor for FnInterceptor<F>
where
    F: Fn(ApiResponse) -> Fut + Send + Sync,
    Fut: Future<Output = SdkResult<ApiResponse>> + Send,
{
    async fn intercept(&self, response: ApiResponse) -> SdkResult<ApiResponse> {
        (self.0)(response).await
    }
}

#[async_trait]
impl<F, Fut> ErrorInterceptor for FnInterceptor<F>
where
    F: Fn(SdkError) -> Fut + Send + Sync,
    Fut: Future<Output = SdkError> + Send,
{
    async fn intercept(&self, error: SdkError) -> SdkError {
        (self.0)(error).await
    }
}

struct Chain<I: ?Sized> {
    entries: RwLock<Vec<(u64, Arc<I>)>>,
}

impl<I: ?Sized + Send + Sync + 'static> Chain<I> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Vec::new()),
        })
    }

    fn push(self: &Arc<Self>, id: u64, interceptor: Arc<I>) -> Subscription {
        self.entries.write().push((id, interceptor));
        let chain: Weak<Self> = Arc::downgrade(self);
        Subscription::new(id, move || {
            if let Some(chain) = chain.upgrade() {
                chain.entries.write().retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn snapshot(&self) -> Vec<Arc<I>> {
        self.entries.read().iter().map(|(_, i)| Arc::clone(i)).collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Ordered interceptor chains for each phase of a request.
pub struct InterceptorManager {
    request: Arc<Chain<dyn RequestInterceptor>>,
    response: Arc<Chain<dyn ResponseInterceptor>>,
    error: Arc<Chain<dyn ErrorInterceptor>>,
    next_id: AtomicU64,
}

impl Default for InterceptorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterceptorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorManager")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .field("error", &self.error.len())
            .finish()
    }
}

impl InterceptorManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            request: Chain::new(),
            response: Chain::new(),
            error: Chain::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a request interceptor.
    pub fn add_request(&self, interceptor: Arc<dyn RequestInterceptor>) -> Subscription {
        self.request.push(self.next_id(), interceptor)
    }

    /// Registers a response interceptor.
    pub fn add_response(&self, interceptor: Arc<dyn ResponseInterceptor>) -> Subscription {
        self.response.push(self.next_id(), interceptor)
    }

    /// Registers an error interceptor.
    pub fn add_error(&self, interceptor: Arc<dyn ErrorInterceptor>) -> Subscription {
        self.error.push(self.next_id(), interceptor)
    }

    /// Registers an async closure as a request interceptor.
    pub fn on_request<F, Fut>(&self, f: F) -> Subscription
    where
        F: Fn(RequestOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<RequestOptions>> + Send + 'static,
    {
        self.add_request(Arc::new(FnInterceptor(f)))
    }

    /// Registers an async closure as a response interceptor.
    pub fn on_response<F, Fut>(&self, f: F) -> Subscription
    where
        F: Fn(ApiResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<ApiResponse>> + Send + 'static,
    {
        self.add_response(Arc::new(FnInterceptor(f)))
    }

    /// Registers an async closure as an error interceptor.
    pub fn on_error<F, Fut>(&self, f: F) -> Subscription
    where
        F: Fn(SdkError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkError> + Send + 'static,
    {
        self.add_error(Arc::new(FnInterceptor(f)))
    }

    /// Threads request options through the request chain.
    pub async fn apply_request(&self, mut options: RequestOptions) -> SdkResult<RequestOptions> {
        for interceptor in self.request.snapshot() {
            options = interceptor.intercept(options).await?;
        }
        Ok(options)
    }

    /// Threads a response through the response chain.
    pub async fn apply_response(&self, mut response: ApiResponse) -> SdkResult<ApiResponse> {
        for interceptor in self.response.snapshot() {
            response = interceptor.intercept(response).await?;
        }
        Ok(response)
    }

    /// Threads an error through the error chain.
    pub async fn apply_error(&self, mut error: SdkError) -> SdkError {
        let chain = self.error.snapshot();
        if !chain.is_empty() {
            debug!(interceptors = chain.len(), code = error.code(), "Applying error interceptors");
        }
        for interceptor in chain {
            error = interceptor.intercept(error).await;
        }
        error
    }

    /// Returns the number of interceptors in each phase as (request, response, error).
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.request.len(), self.response.len(), self.error.len())
    }

    /// Removes every interceptor.
    pub fn clear(&self) {
        self.request.clear();
        self.response.clear();
        self.error.clear();
    }
}
