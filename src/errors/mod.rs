//! Error types for the resilient client.
//!
//! Every failure the pipeline surfaces is a [`SdkError`]. Whatever the variant,
//! it projects onto the same closed shape (`message`, `code`, `status`,
//! `details`, `request_id`) through the accessor methods and [`ErrorRecord`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Error codes attached to errors raised by the pipeline itself.
pub mod codes {
    /// Invalid or missing configuration.
    pub const CONFIGURATION: &str = "CONFIGURATION_ERROR";
    /// Non-2xx response without a backend-provided code.
    pub const HTTP: &str = "HTTP_ERROR";
    /// Per-attempt timeout elapsed.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// Connection could not be established or was reset.
    pub const CONNECTION: &str = "CONNECTION_ERROR";
    /// Other network-level failure.
    pub const NETWORK: &str = "NETWORK_ERROR";
    /// The in-flight attempt was aborted.
    pub const CANCELLED: &str = "CANCELLED";
    /// Rate limit exceeded under the throw strategy.
    pub const RATE_LIMITED: &str = "RATE_LIMIT_EXCEEDED";
    /// Circuit breaker rejected the call.
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    /// Batch processor failure.
    pub const BATCH: &str = "BATCH_ERROR";
    /// Batch response count did not match the request count.
    pub const BATCH_MISMATCH: &str = "BATCH_SIZE_MISMATCH";
    /// Body could not be encoded or decoded.
    pub const SERIALIZATION: &str = "SERIALIZATION_ERROR";
    /// An interceptor rejected the value it was given.
    pub const INTERCEPTOR: &str = "INTERCEPTOR_ERROR";
}

/// Error type for every operation exposed by the client.
#[derive(Debug, Clone, Error)]
pub enum SdkError {
    /// Configuration error, raised at construction time.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Non-2xx HTTP response.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message, from the backend body when available.
        message: String,
        /// Backend error code.
        code: Option<String>,
        /// Extra backend payload, or the raw body when it was not recognised.
        details: Option<serde_json::Value>,
        /// Request identifier for correlation.
        request_id: Option<String>,
    },

    /// Per-attempt timeout elapsed before the transport answered.
    #[error("Request timed out after {timeout:?}")]
    Timeout {
        /// The timeout that was exceeded.
        timeout: Duration,
        /// Request identifier for correlation.
        request_id: Option<String>,
    },

    /// Connection failure (refused, reset, DNS).
    #[error("Connection error: {message}")]
    Connection {
        /// Error message.
        message: String,
    },

    /// Other transport-level failure.
    #[error("Network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The attempt was cancelled through its abort signal.
    #[error("Request cancelled")]
    Cancelled,

    /// Rate limit exceeded.
    #[error("Rate limit exceeded for key '{key}'")]
    RateLimited {
        /// Rate limit key.
        key: String,
        /// Time until the current window resets.
        retry_after: Duration,
    },

    /// Circuit breaker is open.
    #[error("Circuit breaker open: service temporarily unavailable")]
    CircuitOpen {
        /// Time until a trial call will be allowed, when known.
        retry_after: Option<Duration>,
    },

    /// Batch processor failure.
    #[error("Batch error: {message}")]
    Batch {
        /// Error message.
        message: String,
    },

    /// The batch handler returned a different number of responses than requests.
    #[error("Batch response count mismatch: expected {expected}, got {actual}")]
    BatchMismatch {
        /// Number of requests in the batch.
        expected: usize,
        /// Number of responses returned.
        actual: usize,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },

    /// An interceptor failed.
    #[error("Interceptor error: {message}")]
    Interceptor {
        /// Error message.
        message: String,
    },
}

/// The closed error shape handed to callers and event listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Human readable message.
    pub message: String,
    /// Machine readable code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// HTTP status, when the error came from a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Opaque backend payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Request identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Debug rendering of the original error. Only populated in non-production builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

const NETWORK_FAILURE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "enotfound",
    "eai_again",
    "dns",
    "socket hang up",
    "broken pipe",
];

impl SdkError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        SdkError::Configuration {
            message: message.into(),
        }
    }

    /// Creates a batch error.
    pub fn batch(message: impl Into<String>) -> Self {
        SdkError::Batch {
            message: message.into(),
        }
    }

    /// Creates an HTTP error with only a status and message.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        SdkError::Http {
            status,
            message: message.into(),
            code: None,
            details: None,
            request_id: None,
        }
    }

    /// Returns the human readable message.
    pub fn message(&self) -> String {
        match self {
            SdkError::Http { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Returns the machine readable code.
    pub fn code(&self) -> &str {
        match self {
            SdkError::Configuration { .. } => codes::CONFIGURATION,
            SdkError::Http { code, .. } => code.as_deref().unwrap_or(codes::HTTP),
            SdkError::Timeout { .. } => codes::TIMEOUT,
            SdkError::Connection { .. } => codes::CONNECTION,
            SdkError::Network { .. } => codes::NETWORK,
            SdkError::Cancelled => codes::CANCELLED,
            SdkError::RateLimited { .. } => codes::RATE_LIMITED,
            SdkError::CircuitOpen { .. } => codes::CIRCUIT_OPEN,
            SdkError::Batch { .. } => codes::BATCH,
            SdkError::BatchMismatch { .. } => codes::BATCH_MISMATCH,
            SdkError::Serialization { .. } => codes::SERIALIZATION,
            SdkError::Interceptor { .. } => codes::INTERCEPTOR,
        }
    }

    /// Returns the HTTP status, if any.
    ///
    /// Rate-limit rejections report 429 so callers can treat local and remote
    /// throttling alike.
    pub fn status(&self) -> Option<u16> {
        match self {
            SdkError::Http { status, .. } => Some(*status),
            SdkError::RateLimited { .. } => Some(429),
            SdkError::CircuitOpen { .. } => Some(503),
            _ => None,
        }
    }

    /// Returns the opaque details payload, if any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            SdkError::Http { details, .. } => details.clone(),
            SdkError::RateLimited { key, retry_after } => Some(serde_json::json!({
                "key": key,
                "retryAfterMs": retry_after.as_millis() as u64,
            })),
            SdkError::CircuitOpen {
                retry_after: Some(retry_after),
            } => Some(serde_json::json!({
                "retryAfterMs": retry_after.as_millis() as u64,
            })),
            SdkError::BatchMismatch { expected, actual } => Some(serde_json::json!({
                "expected": expected,
                "actual": actual,
            })),
            _ => None,
        }
    }

    /// Returns the request identifier, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SdkError::Http { request_id, .. } | SdkError::Timeout { request_id, .. } => {
                request_id.as_deref()
            }
            _ => None,
        }
    }

    /// Attaches a request identifier when the variant carries one and it is unset.
    pub fn with_request_id(mut self, id: &str) -> Self {
        match &mut self {
            SdkError::Http { request_id, .. } | SdkError::Timeout { request_id, .. } => {
                if request_id.is_none() {
                    *request_id = Some(id.to_string());
                }
            }
            _ => {}
        }
        self
    }

    /// Projects the error onto the closed [`ErrorRecord`] shape.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            message: self.message(),
            code: Some(self.code().to_string()),
            status: self.status(),
            details: self.details(),
            request_id: self.request_id().map(str::to_string),
            cause: if cfg!(debug_assertions) {
                Some(format!("{self:?}"))
            } else {
                None
            },
        }
    }

    /// Returns true if this error is retryable by default.
    ///
    /// Retryable: HTTP 5xx, 408 and 429, timeouts, connection failures, and
    /// network failures whose message names a recognised transient condition.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Http { status, .. } => is_retryable_status(*status),
            SdkError::Timeout { .. } | SdkError::Connection { .. } => true,
            SdkError::Network { message } => is_network_failure_message(message),
            _ => false,
        }
    }

    /// Returns true if this error should count toward the circuit breaker threshold.
    ///
    /// Client-side errors (4xx other than 408/429) and local admission or
    /// configuration errors do not indicate an unhealthy dependency.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            SdkError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            SdkError::Timeout { .. } | SdkError::Connection { .. } | SdkError::Network { .. } => {
                true
            }
            _ => false,
        }
    }
}

/// Returns true for HTTP statuses retried by default.
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Returns true if a message describes a transient network failure.
pub fn is_network_failure_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    NETWORK_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Error body returned by the backend, either flat or nested under `error`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    message: Option<String>,
    code: Option<serde_json::Value>,
    details: Option<serde_json::Value>,
    #[serde(alias = "request_id")]
    request_id: Option<String>,
    error: Option<ApiErrorNested>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum ApiErrorNested {
    Object(ApiErrorFields),
    Message(String),
    #[default]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorFields {
    message: Option<String>,
    code: Option<serde_json::Value>,
    details: Option<serde_json::Value>,
    #[serde(alias = "request_id")]
    request_id: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn code_to_string(code: serde_json::Value) -> Option<String> {
    match code {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds an [`SdkError::Http`] from a non-2xx response.
///
/// Bodies matching the recognised error shape are narrowed into structured
/// fields; any other body is carried verbatim in `details`.
pub fn error_from_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> SdkError {
    let header_request_id = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-request-id"))
        .map(|(_, v)| v.clone());
    let fallback_message = format!("HTTP {status} error");

    let parsed = serde_json::from_slice::<serde_json::Value>(body).ok();
    let structured = parsed
        .as_ref()
        .filter(|v| v.is_object())
        .and_then(|v| serde_json::from_value::<ApiErrorBody>(v.clone()).ok());

    match structured {
        Some(api)
            if api.message.is_some()
                || matches!(
                    api.error,
                    Some(ApiErrorNested::Object(_) | ApiErrorNested::Message(_))
                ) =>
        {
            let mut nested = match api.error {
                Some(ApiErrorNested::Object(fields)) => fields,
                Some(ApiErrorNested::Message(message)) => ApiErrorFields {
                    message: Some(message),
                    ..Default::default()
                },
                _ => ApiErrorFields::default(),
            };
            SdkError::Http {
                status,
                message: api
                    .message
                    .or(nested.message)
                    .unwrap_or(fallback_message),
                code: api.code.or(nested.code).and_then(code_to_string),
                details: api.details.or(nested.details).or_else(|| {
                    // Unrecognised fields are carried in details.
                    let mut extra = api.extra;
                    extra.append(&mut nested.extra);
                    (!extra.is_empty()).then_some(serde_json::Value::Object(extra))
                }),
                request_id: api
                    .request_id
                    .or(nested.request_id)
                    .or(header_request_id),
            }
        }
        _ => {
            let details = match parsed {
                Some(value) => Some(value),
                None if body.is_empty() => None,
                None => Some(serde_json::Value::String(
                    String::from_utf8_lossy(body).into_owned(),
                )),
            };
            SdkError::Http {
                status,
                message: fallback_message,
                code: None,
                details,
                request_id: header_request_id,
            }
        }
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SdkError::Network {
                message: format!("timeout: {err}"),
            }
        } else if err.is_connect() {
            SdkError::Connection {
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SdkError::Serialization {
                message: err.to_string(),
            }
        } else {
            SdkError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for SdkError {
    fn from(err: url::ParseError) -> Self {
        SdkError::Configuration {
            message: format!("Invalid URL: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(500, true ; "internal error")]
    #[test_case(503, true ; "unavailable")]
    #[test_case(408, true ; "request timeout")]
    #[test_case(429, true ; "too many requests")]
    #[test_case(400, false ; "bad request")]
    #[test_case(404, false ; "not found")]
    #[test_case(401, false ; "unauthorized")]
    fn test_http_retryability(status: u16, expected: bool) {
        assert_eq!(SdkError::http(status, "x").is_retryable(), expected);
    }

    #[test]
    fn test_network_messages_classified() {
        let reset = SdkError::Network {
            message: "read ECONNRESET".to_string(),
        };
        assert!(reset.is_retryable());

        let dns = SdkError::Network {
            message: "getaddrinfo ENOTFOUND api.example.com".to_string(),
        };
        assert!(dns.is_retryable());

        let other = SdkError::Network {
            message: "certificate verify failed".to_string(),
        };
        assert!(!other.is_retryable());
    }

    #[test]
    fn test_admission_errors_not_retryable() {
        assert!(!SdkError::CircuitOpen { retry_after: None }.is_retryable());
        assert!(!SdkError::RateLimited {
            key: "k".to_string(),
            retry_after: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(!SdkError::configuration("bad").is_retryable());
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(SdkError::http(502, "x").counts_as_breaker_failure());
        assert!(!SdkError::http(422, "x").counts_as_breaker_failure());
        assert!(SdkError::Connection {
            message: "refused".to_string()
        }
        .counts_as_breaker_failure());
    }

    #[test]
    fn test_error_from_flat_body() {
        let body = br#"{"message":"Invalid token","code":"AUTH_INVALID","details":{"field":"token"}}"#;
        let err = error_from_response(401, &HashMap::new(), body);

        assert_eq!(err.status(), Some(401));
        assert_eq!(err.message(), "Invalid token");
        assert_eq!(err.code(), "AUTH_INVALID");
        assert_eq!(err.details(), Some(serde_json::json!({"field": "token"})));
    }

    #[test]
    fn test_error_from_nested_body() {
        let body = br#"{"error":{"message":"Slow down","code":429,"requestId":"req-1"}}"#;
        let err = error_from_response(429, &HashMap::new(), body);

        assert_eq!(err.message(), "Slow down");
        assert_eq!(err.code(), "429");
        assert_eq!(err.request_id(), Some("req-1"));
    }

    #[test]
    fn test_unknown_fields_are_carried_in_details() {
        let body = br#"{"message":"bad","field":"email","constraint":"format"}"#;
        let err = error_from_response(400, &HashMap::new(), body);

        assert_eq!(err.message(), "bad");
        assert_eq!(
            err.details(),
            Some(serde_json::json!({"field": "email", "constraint": "format"}))
        );
    }

    #[test]
    fn test_unknown_nested_fields_are_carried_in_details() {
        let body = br#"{"error":{"message":"conflict","resource":"order"},"trace":"t-1"}"#;
        let err = error_from_response(409, &HashMap::new(), body);

        assert_eq!(err.message(), "conflict");
        assert_eq!(
            err.details(),
            Some(serde_json::json!({"resource": "order", "trace": "t-1"}))
        );
    }

    #[test]
    fn test_explicit_details_take_precedence_over_unknown_fields() {
        let body = br#"{"message":"bad","details":{"a":1},"extra":true}"#;
        let err = error_from_response(400, &HashMap::new(), body);

        assert_eq!(err.details(), Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_error_from_unrecognised_body_keeps_raw_details() {
        let mut headers = HashMap::new();
        headers.insert("X-Request-Id".to_string(), "req-42".to_string());
        let err = error_from_response(502, &headers, b"<html>bad gateway</html>");

        assert_eq!(err.message(), "HTTP 502 error");
        assert_eq!(err.code(), codes::HTTP);
        assert_eq!(
            err.details(),
            Some(serde_json::Value::String("<html>bad gateway</html>".to_string()))
        );
        assert_eq!(err.request_id(), Some("req-42"));
    }

    #[test]
    fn test_record_shape() {
        let err = SdkError::http(500, "boom").with_request_id("req-9");
        let record = err.to_record();

        assert_eq!(record.message, "boom");
        assert_eq!(record.code.as_deref(), Some(codes::HTTP));
        assert_eq!(record.status, Some(500));
        assert_eq!(record.request_id.as_deref(), Some("req-9"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["requestId"], "req-9");
    }

    #[test]
    fn test_rate_limited_record_has_details() {
        let err = SdkError::RateLimited {
            key: "global".to_string(),
            retry_after: Duration::from_millis(250),
        };
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.details().unwrap()["retryAfterMs"], 250);
    }
}
