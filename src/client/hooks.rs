//! Glue between the resilience components and the client's event stream.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Weak;

use super::{Client, ClientInner, RequestOptions};
use crate::batch::BatchHandler;
use crate::config::Environment;
use crate::errors::{ErrorRecord, SdkError, SdkResult};
use crate::events::{EventEmitter, SdkEvent};
use crate::resilience::{CircuitBreakerHook, CircuitState, RetryContext, RetryHook};
use crate::transport::Method;

pub(super) fn error_record(error: &SdkError, environment: Environment) -> ErrorRecord {
    let mut record = error.to_record();
    if environment.is_production() {
        record.cause = None;
    }
    record
}

/// Publishes breaker transitions on the `circuitBreaker` channel.
pub(super) struct BreakerEvents {
    pub(super) events: EventEmitter,
}

impl CircuitBreakerHook for BreakerEvents {
    fn on_state_change(&self, old_state: CircuitState, new_state: CircuitState) {
        // Transitions triggered outside a runtime (e.g. reset() from sync code) are not published.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let events = self.events.clone();
            handle.spawn(async move {
                events
                    .emit(SdkEvent::CircuitBreaker {
                        from: old_state.to_string(),
                        to: new_state.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
            });
        }
    }
}

/// Publishes scheduled retries on the `retry` channel.
pub(super) struct RetryEvents {
    pub(super) events: EventEmitter,
    pub(super) request_id: String,
    pub(super) environment: Environment,
}

#[async_trait]
impl RetryHook for RetryEvents {
    async fn on_retry(&self, context: RetryContext) {
        self.events
            .emit(SdkEvent::Retry {
                request_id: self.request_id.clone(),
                attempt: context.attempt,
                max_attempts: context.max_attempts,
                delay_ms: context.delay.as_millis() as u64,
                error: error_record(&context.error, self.environment),
                timestamp: Utc::now(),
            })
            .await;
    }
}

/// Sends coalesced payloads as `POST {path}` with body `{"requests": [...]}`.
///
/// The endpoint must answer with a JSON array aligned with the requests; a
/// `null` entry rejects only the matching caller.
pub(super) struct BatchEndpoint {
    pub(super) client: Weak<ClientInner>,
    pub(super) path: String,
}

#[async_trait]
impl BatchHandler<Value, Value> for BatchEndpoint {
    async fn process(&self, requests: Vec<Value>) -> SdkResult<Vec<Option<Value>>> {
        let inner = self
            .client
            .upgrade()
            .ok_or_else(|| SdkError::batch("Client was dropped before the batch was sent"))?;
        let client = Client { inner };

        let options = RequestOptions::default()
            .method(Method::Post)
            .body(serde_json::json!({ "requests": requests }));
        let response = client.request_raw(&self.path, options).await?;

        match response.data {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|item| (!item.is_null()).then_some(item))
                .collect()),
            _ => Err(SdkError::Serialization {
                message: "Batch endpoint must respond with a JSON array".to_string(),
            }),
        }
    }
}
