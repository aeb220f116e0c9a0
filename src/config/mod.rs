//! Configuration module for the client.
//!
//! Provides the base endpoint, credentials, timeouts, default headers, and the
//! per-component configuration for the cache, rate limiter, circuit breaker,
//! retry policy, and batch processor.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::errors::{SdkError, SdkResult};
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default path for coalesced batch requests.
pub const DEFAULT_BATCH_PATH: &str = "/batch";

/// Default user agent.
pub const DEFAULT_USER_AGENT: &str = concat!("resilient-client/", env!("CARGO_PKG_VERSION"));

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Production. Error records omit diagnostic causes.
    #[default]
    Production,
    /// Development. Error records keep diagnostic causes.
    Development,
}

impl Environment {
    /// Returns true for [`Environment::Production`].
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" | "test" => Ok(Environment::Development),
            other => Err(SdkError::configuration(format!("Unknown environment '{other}'"))),
        }
    }
}

/// Configuration for the client.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base endpoint, without trailing slash.
    pub base_url: String,
    pub(crate) api_key: Option<SecretString>,
    /// Default per-attempt timeout.
    pub timeout: Duration,
    /// Headers sent with every request.
    pub default_headers: HashMap<String, String>,
    /// User agent header value.
    pub user_agent: String,
    /// Deployment environment.
    pub environment: Environment,
    /// Response cache. `None` disables caching.
    pub cache: Option<CacheConfig>,
    /// Rate limiter. `None` disables admission control.
    pub rate_limit: Option<RateLimiterConfig>,
    /// Circuit breaker. `None` calls the transport directly.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Retry policy. `None` runs each request once.
    pub retry: Option<RetryConfig>,
    /// Batch processor for [`Client::request_batched`](crate::Client::request_batched).
    pub batch: Option<BatchConfig>,
    /// Path the batch processor posts to.
    pub batch_path: String,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SDK_BASE_URL` (required): base endpoint
    /// - `SDK_API_KEY` (optional): bearer token
    /// - `SDK_TIMEOUT_MS` (optional): per-attempt timeout in milliseconds
    /// - `SDK_MAX_RETRIES` (optional): retries after the first attempt
    /// - `SDK_CACHE_TTL_MS` (optional): enables the cache with this TTL
    /// - `SDK_ENVIRONMENT` (optional): `production` or `development`
    pub fn from_env() -> SdkResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> SdkResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("SDK_BASE_URL").ok_or_else(|| {
            SdkError::configuration("SDK_BASE_URL environment variable not set")
        })?;

        let mut builder = ClientConfigBuilder::new().base_url(base_url);

        if let Some(api_key) = lookup("SDK_API_KEY") {
            builder = builder.api_key(api_key);
        }

        if let Some(ms) = lookup("SDK_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        if let Some(retries) = lookup("SDK_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
            builder = builder.retry(RetryConfig::default().max_attempts(retries.saturating_add(1)));
        }

        if let Some(ms) = lookup("SDK_CACHE_TTL_MS").and_then(|v| v.parse::<u64>().ok()) {
            builder = builder.cache(CacheConfig::with_ttl(Duration::from_millis(ms)));
        }

        if let Some(environment) = lookup("SDK_ENVIRONMENT") {
            builder = builder.environment(environment.parse()?);
        }

        builder.build()
    }

    /// Returns the API key (exposing the secret).
    pub(crate) fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret().as_str())
    }

    /// Returns true when an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Returns the full URL for a path.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("environment", &self.environment)
            .field("cache", &self.cache)
            .field("rate_limit", &self.rate_limit)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("retry", &self.retry)
            .field("batch", &self.batch)
            .finish()
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Option<Duration>,
    default_headers: HashMap<String, String>,
    user_agent: Option<String>,
    environment: Environment,
    cache: Option<CacheConfig>,
    rate_limit: Option<RateLimiterConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryConfig>,
    batch: Option<BatchConfig>,
    batch_path: Option<String>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout: None,
            default_headers: HashMap::new(),
            user_agent: None,
            environment: Environment::default(),
            cache: None,
            rate_limit: None,
            circuit_breaker: None,
            retry: Some(RetryConfig::default()),
            batch: None,
            batch_path: None,
        }
    }
}

impl ClientConfigBuilder {
    /// Creates a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base endpoint. Required.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the bearer token.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the default per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Sets the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the environment.
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Enables the response cache.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Enables the rate limiter.
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Enables the circuit breaker.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Disables retries.
    pub fn no_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    /// Enables the batch processor.
    pub fn batch(mut self, config: BatchConfig) -> Self {
        self.batch = Some(config);
        self
    }

    /// Sets the batch endpoint path.
    pub fn batch_path(mut self, path: impl Into<String>) -> Self {
        self.batch_path = Some(path.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SdkResult<ClientConfig> {
        let base_url = self
            .base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SdkError::configuration("Base URL is required"))?;

        let parsed = url::Url::parse(&base_url)
            .map_err(|e| SdkError::configuration(format!("Invalid base URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SdkError::configuration(
                "Base URL must start with http:// or https://",
            ));
        }

        let api_key = match self.api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(SdkError::configuration("API key cannot be empty"));
            }
            Some(key) => Some(SecretString::new(key)),
            None => None,
        };

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(SdkError::configuration("Timeout must be greater than zero"));
        }

        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        let batch_path = self
            .batch_path
            .unwrap_or_else(|| DEFAULT_BATCH_PATH.to_string());

        Ok(ClientConfig {
            base_url,
            api_key,
            timeout,
            default_headers: self.default_headers,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            environment: self.environment,
            cache: self.cache,
            rate_limit: self.rate_limit,
            circuit_breaker: self.circuit_breaker,
            retry: self.retry,
            batch: self.batch,
            batch_path,
        })
    }
}
