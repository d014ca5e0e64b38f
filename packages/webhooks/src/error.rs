// ABOUTME: Error types for webhook registration and delivery
// ABOUTME: Transport failures are recorded on deliveries and never surface to executions

use corral_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Unknown webhook event: {0}")]
    InvalidEvent(String),

    #[error("Webhook not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<StorageError> for WebhookError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => WebhookError::NotFound(id),
            other => WebhookError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
