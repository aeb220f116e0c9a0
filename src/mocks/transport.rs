//! Mock transport for testing.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::{SdkError, SdkResult};
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
    /// Time the transport takes before answering. Cancellation cuts it short.
    pub delay: Option<Duration>,
}

impl MockResponse {
    /// Creates a JSON response with the given status.
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Bytes::from(body.to_string()),
            delay: None,
        }
    }

    /// Creates a 200 JSON response.
    pub fn ok(body: serde_json::Value) -> Self {
        Self::json(200, body)
    }

    /// Creates an error response in the nested `{"error": {...}}` shape.
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(
            status,
            serde_json::json!({ "error": { "message": message } }),
        )
    }

    /// Creates a plain text response.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
            delay: None,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    /// Delays the response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Transport that records requests and replays queued replies.
///
/// When the queue is empty the default reply is used, or a 500 if none is set.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<VecDeque<SdkResult<MockResponse>>>,
    requests: Mutex<Vec<TransportRequest>>,
    default_reply: Option<MockResponse>,
}

impl MockTransport {
    /// Creates a mock transport with no queued replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reply used once the queue is empty.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_reply = Some(response);
        self
    }

    /// Queues a response.
    pub fn enqueue_response(&self, response: MockResponse) {
        self.replies.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn enqueue_error(&self, error: SdkError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Returns every recorded request.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    /// Returns the last recorded request.
    pub fn last_request(&self) -> Option<TransportRequest> {
        self.requests.lock().last().cloned()
    }

    /// Returns the number of requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_reply(&self) -> SdkResult<MockResponse> {
        self.replies.lock().pop_front().unwrap_or_else(|| {
            Ok(self
                .default_reply
                .clone()
                .unwrap_or_else(|| MockResponse::error(500, "No mock response configured")))
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> SdkResult<TransportResponse> {
        self.requests.lock().push(request);
        let response = self.next_reply()?;

        if let Some(delay) = response.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SdkError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(TransportResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }
}
