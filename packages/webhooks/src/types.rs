// ABOUTME: Webhook, event and delivery records
// ABOUTME: Event kinds use dotted wire names such as `execution.completed`

use chrono::{DateTime, Utc};
use corral_storage::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WebhookEventKind {
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
}

impl WebhookEventKind {
    pub const ALL: [WebhookEventKind; 2] = [Self::ExecutionCompleted, Self::ExecutionFailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for WebhookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub events: BTreeSet<WebhookEventKind>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, kind: WebhookEventKind) -> bool {
        self.enabled && self.events.contains(&kind)
    }
}

/// One outcome to fan out; serialized as the POST body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: WebhookEventKind,
    pub session_id: String,
    pub execution_id: String,
    pub occurred_at: DateTime<Utc>,
    pub data: Value,
}

impl WebhookEvent {
    pub fn new(
        kind: WebhookEventKind,
        session_id: impl Into<String>,
        execution_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: corral_storage::generate_id("evt"),
            kind,
            session_id: session_id.into(),
            execution_id: execution_id.into(),
            occurred_at: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

/// One webhook's attempts at one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub webhook_id: String,
    pub event_id: String,
    pub event_kind: WebhookEventKind,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn pending(webhook_id: &str, event: &WebhookEvent, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: corral_storage::generate_id("dlv"),
            webhook_id: webhook_id.to_string(),
            event_id: event.id.clone(),
            event_kind: event.kind,
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_status_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
