// ABOUTME: Shared API response types
// ABOUTME: Provides the consistent success envelope used by every JSON endpoint

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
};
use serde::Serialize;

use crate::error::AppError;

/// Standard API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

pub type ApiResult = Result<Response, AppError>;

/// 200 with `data` in the envelope
pub fn ok<T: Serialize>(data: T) -> ApiResult {
    Ok((StatusCode::OK, ResponseJson(ApiResponse::success(data))).into_response())
}

/// Success envelope with an explicit status (201, 202)
pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    Ok((status, ResponseJson(ApiResponse::success(data))).into_response())
}
