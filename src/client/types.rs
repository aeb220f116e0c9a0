//! Request options and response types.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::errors::{SdkError, SdkResult};
use crate::transport::Method;

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// HTTP method.
    pub method: Method,
    /// Query parameters, kept sorted so cache keys are order-independent.
    pub query: BTreeMap<String, String>,
    /// JSON body.
    pub body: Option<serde_json::Value>,
    /// Extra headers, overriding client defaults.
    pub headers: HashMap<String, String>,
    /// Per-attempt timeout, overriding the client default.
    pub timeout: Option<Duration>,
    /// Bypass the response cache for this request.
    pub skip_cache: bool,
}

impl RequestOptions {
    /// Options for a GET request.
    pub fn get() -> Self {
        Self::default()
    }

    /// Options for a DELETE request.
    pub fn delete() -> Self {
        Self::default().method(Method::Delete)
    }

    /// Options for a request with a JSON body.
    pub fn with_body<B: Serialize>(method: Method, body: &B) -> SdkResult<Self> {
        Ok(Self::default().method(method).body(serde_json::to_value(body)?))
    }

    /// Sets the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(name.into(), value.to_string());
        self
    }

    /// Sets the JSON body.
    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bypasses the cache.
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Body as JSON. Non-JSON bodies are carried as a string, empty ones as null.
    pub data: serde_json::Value,
}

impl ApiResponse {
    /// Deserializes the body.
    pub fn into_data<T: DeserializeOwned>(self) -> SdkResult<T> {
        serde_json::from_value(self.data).map_err(SdkError::from)
    }

    pub(crate) fn parse_body(body: &[u8]) -> serde_json::Value {
        if body.is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_slice(body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_variants() {
        assert_eq!(ApiResponse::parse_body(b""), serde_json::Value::Null);
        assert_eq!(ApiResponse::parse_body(br#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(ApiResponse::parse_body(b"plain"), serde_json::json!("plain"));
    }

    #[test]
    fn test_options_builder() {
        let options = RequestOptions::get()
            .query("b", 2)
            .query("a", "x")
            .header("x-tenant", "acme")
            .skip_cache();

        assert_eq!(options.method, Method::Get);
        assert_eq!(options.query.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(options.skip_cache);
    }
}
