//! HTTP transport layer.
//!
//! The client talks to the network only through the [`Transport`] trait. A
//! transport reports every HTTP status as a [`TransportResponse`] and fails
//! only when no response was received.

mod http_transport;

pub use http_transport::ReqwestTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::errors::{SdkError, SdkResult};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    /// GET request.
    #[default]
    Get,
    /// POST request.
    Post,
    /// PUT request.
    Put,
    /// PATCH request.
    Patch,
    /// DELETE request.
    Delete,
}

impl Method {
    /// Returns the uppercase method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A fully resolved outgoing request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub body: Option<Bytes>,
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> SdkResult<T> {
        serde_json::from_slice(&self.body).map_err(SdkError::from)
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Trait for HTTP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request.
    ///
    /// Implementations must stop work and return [`SdkError::Cancelled`] once
    /// `cancel` fires.
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> SdkResult<TransportResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_helpers() {
        let response = TransportResponse {
            status: 201,
            headers: HashMap::from([("X-Request-Id".to_string(), "abc".to_string())]),
            body: Bytes::from_static(br#"{"a":1}"#),
        };

        assert!(response.is_success());
        assert_eq!(response.header("x-request-id"), Some("abc"));
        assert_eq!(response.json::<serde_json::Value>().unwrap()["a"], 1);
        assert_eq!(response.text(), r#"{"a":1}"#);
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let response = TransportResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from_static(b"not json"),
        };
        assert!(matches!(
            response.json::<serde_json::Value>(),
            Err(SdkError::Serialization { .. })
        ));
    }
}
