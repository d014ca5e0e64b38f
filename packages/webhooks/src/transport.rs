// ABOUTME: Outbound HTTP for webhook deliveries behind a swappable trait
// ABOUTME: HttpTransport posts JSON with event and delivery headers and a request timeout

use crate::error::{Result, WebhookError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub const EVENT_HEADER: &str = "X-Corral-Event";
pub const DELIVERY_HEADER: &str = "X-Corral-Delivery";

/// A single POST attempt
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub event_kind: String,
    pub delivery_id: String,
    pub body: Value,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Send the request and return the response status code
    ///
    /// Connection-level failures are errors; any HTTP response, including
    /// 4xx and 5xx, is an `Ok` status.
    async fn post(&self, request: &OutboundRequest) -> Result<u16>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("corral-webhooks/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WebhookError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<u16> {
        let response = self
            .client
            .post(&request.url)
            .header(EVENT_HEADER, &request.event_kind)
            .header(DELIVERY_HEADER, &request.delivery_id)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WebhookError::Transport(format!("request to {} timed out", request.url))
                } else {
                    WebhookError::Transport(e.to_string())
                }
            })?;

        Ok(response.status().as_u16())
    }
}
