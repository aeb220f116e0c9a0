//! HTTP transport implementation using reqwest.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Transport, TransportRequest, TransportResponse};
use crate::errors::{SdkError, SdkResult};

/// Reqwest-based transport.
///
/// Per-attempt timeouts are enforced by the client through the cancellation
/// token; `connect_timeout` only bounds connection establishment.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a pooled client.
    pub fn new(connect_timeout: Duration) -> SdkResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| SdkError::Configuration {
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self { client })
    }

    /// Creates a transport around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn perform(&self, request: TransportRequest) -> SdkResult<TransportResponse> {
        let mut builder = self.client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        trace!(status, bytes = body.len(), "Received response");

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> SdkResult<TransportResponse> {
        trace!(method = %request.method, url = %request.url, "Sending request");

        tokio::select! {
            _ = cancel.cancelled() => Err(SdkError::Cancelled),
            result = self.perform(request) => result,
        }
    }
}
