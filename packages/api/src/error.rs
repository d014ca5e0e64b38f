// ABOUTME: Application error type returned by every handler
// ABOUTME: Maps domain errors onto HTTP status codes and machine-readable error codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use corral_executions::ExecutionError;
use corral_sandbox::ProviderError;
use corral_sessions::SessionError;
use corral_webhooks::WebhookError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    data: Option<()>,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

fn session_status(err: &SessionError) -> (StatusCode, &'static str) {
    match err {
        SessionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        SessionError::SandboxUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "SANDBOX_UNAVAILABLE")
        }
        SessionError::ConflictingTransition(_) => (StatusCode::CONFLICT, "CONFLICTING_TRANSITION"),
        SessionError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
        SessionError::NotRunning { .. } => (StatusCode::CONFLICT, "SESSION_NOT_RUNNING"),
        SessionError::SessionBusy { .. } => (StatusCode::CONFLICT, "SESSION_BUSY"),
        SessionError::Provider(provider) => provider_status(provider),
        SessionError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

fn provider_status(err: &ProviderError) -> (StatusCode, &'static str) {
    match err {
        ProviderError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        ProviderError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        ProviderError::NotSupported(_) => (StatusCode::NOT_IMPLEMENTED, "NOT_SUPPORTED"),
        ProviderError::ConnectionError(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "SANDBOX_UNAVAILABLE")
        }
        ProviderError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "SANDBOX_TIMEOUT"),
        ProviderError::ContainerError(_)
        | ProviderError::ImageError(_)
        | ProviderError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

impl AppError {
    /// HTTP status and the code clients match on
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Session(err) => session_status(err),
            AppError::Execution(err) => match err {
                ExecutionError::InvalidParams(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                ExecutionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ExecutionError::Session(err) => session_status(err),
                ExecutionError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            AppError::Webhook(err) => match err {
                WebhookError::InvalidUrl(_) | WebhookError::InvalidEvent(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                WebhookError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                WebhookError::Storage(_) | WebhookError::Transport(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
            AppError::Provider(err) => provider_status(err),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Message safe to show clients; internal details stay in the logs
    pub fn user_message(&self) -> String {
        match self.status_and_code().0 {
            StatusCode::INTERNAL_SERVER_ERROR => "An internal server error occurred".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.status_and_code();

        if status_code.is_server_error() {
            error!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "Internal server error occurred"
            );
        } else {
            info!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "API error response"
            );
        }

        let body = ErrorResponse {
            success: false,
            data: None,
            error: ErrorDetail {
                code: error_code,
                message: self.user_message(),
            },
            request_id,
        };

        (status_code, Json(body)).into_response()
    }
}
