// ABOUTME: Errors raised while wiring and starting the server
// ABOUTME: Each engine component's error converts in; the binary reports them through anyhow

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Storage(#[from] corral_storage::StorageError),

    #[error("Session recovery failed: {0}")]
    Session(#[from] corral_sessions::SessionError),

    #[error("Execution recovery failed: {0}")]
    Execution(#[from] corral_executions::ExecutionError),

    #[error("Webhook setup failed: {0}")]
    Webhook(#[from] corral_webhooks::WebhookError),

    #[error("Invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
